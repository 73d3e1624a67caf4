//! HTTP probes built from the profile's `actions` table

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::Value;
use strain_core::{
    ActionConfig, CountRule, HttpConfig, IntRange, Labels, MetricDecl, MetricKind, RequestConfig,
    RunConfig, StrainError, StrainResult,
};
use strain_engine::{Probe, ProbeContext, ProbeError, ProbeFactory, ProbeReport};
use tracing::{debug, trace};

use crate::template::Template;

/// Builds one [`HttpProbe`] per declared action, all sharing one client.
pub struct HttpProbeFactory {
    client: Client,
    base_url: String,
}

impl HttpProbeFactory {
    pub fn new(http: &HttpConfig) -> StrainResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &http.headers {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(http.timeout)
            .default_headers(headers)
            .user_agent(concat!("strain/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StrainError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: http.base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ProbeFactory for HttpProbeFactory {
    fn build(
        &self,
        name: &str,
        action: &ActionConfig,
        run: &RunConfig,
    ) -> StrainResult<Arc<dyn Probe>> {
        let context = |e: StrainError| match e {
            StrainError::Configuration { message } => {
                StrainError::configuration(format!("action `{name}`: {message}"))
            }
            other => other,
        };

        let request = RequestSpec::parse(&action.request, run).map_err(context)?;
        if request.uses_previous() {
            return Err(context(StrainError::configuration(
                "`{prev:...}` is only available in follow-up requests",
            )));
        }
        let follow_ups = action
            .then
            .iter()
            .map(|f| {
                Ok(FollowUpSpec {
                    request: RequestSpec::parse(&f.request, run)?,
                    chance: f.chance,
                    when: f.when.clone(),
                    repeat: f.repeat,
                })
            })
            .collect::<StrainResult<Vec<_>>>()
            .map_err(context)?;

        Ok(Arc::new(HttpProbe {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            needs_previous: follow_ups
                .iter()
                .any(|f| f.when.is_some() || f.request.uses_previous()),
            request,
            follow_ups,
        }))
    }
}

struct RequestSpec {
    method: Method,
    path: Template,
    headers: Vec<(HeaderName, Template)>,
    body: Option<Template>,
    expect: Vec<u16>,
    endpoint: String,
    count: Vec<CountRule>,
}

impl RequestSpec {
    fn parse(config: &RequestConfig, run: &RunConfig) -> StrainResult<Self> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| StrainError::configuration(format!("bad method `{}`", config.method)))?;

        let path = Template::parse(&config.path)?;
        let body = config.body.as_deref().map(Template::parse).transpose()?;
        let mut headers = Vec::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| StrainError::configuration(format!("bad header name `{name}`")))?;
            headers.push((header, Template::parse(value)?));
        }

        let spec = Self {
            method,
            path,
            headers,
            body,
            expect: config.expect.clone(),
            endpoint: config.endpoint_label().to_string(),
            count: config.count.clone(),
        };
        for dataset in spec.templates().flat_map(Template::datasets) {
            if !run.datasets.contains_key(dataset) {
                return Err(StrainError::configuration(format!(
                    "template references undeclared dataset `{dataset}`"
                )));
            }
        }
        Ok(spec)
    }

    fn templates(&self) -> impl Iterator<Item = &Template> {
        std::iter::once(&self.path)
            .chain(self.headers.iter().map(|(_, t)| t))
            .chain(self.body.iter())
    }

    fn uses_previous(&self) -> bool {
        self.templates().any(Template::uses_previous)
    }

    fn reads_body(&self) -> bool {
        self.count.iter().any(CountRule::reads_body)
    }

    /// Bumps the counters whose rules match this response.
    fn tally(&self, ctx: &ProbeContext, status: u16, body: Option<&Value>) {
        if self.count.is_empty() {
            return;
        }
        let mut labels = Labels::new();
        labels.insert("endpoint".to_string(), self.endpoint.clone());

        for rule in &self.count {
            let matches = (rule.status.is_empty() || rule.status.contains(&status))
                && rule.when.as_deref().map_or(true, |p| holds_value(body, p))
                && rule.unless.as_deref().map_or(true, |p| !holds_value(body, p));
            if !matches {
                continue;
            }
            if let Err(err) = ctx.record(&rule.counter, MetricKind::Counter, 1.0, &labels) {
                debug!(counter = %rule.counter, error = %err, "Dropped response count");
            }
        }
    }
}

struct FollowUpSpec {
    request: RequestSpec,
    chance: f64,
    /// Pointer that must hold a value in the first response.
    when: Option<String>,
    repeat: IntRange,
}

/// True when `pointer` resolves to something other than null, `false` or an
/// empty string, array or object.
fn holds_value(body: Option<&Value>, pointer: &str) -> bool {
    match body.and_then(|b| b.pointer(pointer)) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(_) => true,
    }
}

/// Issues one request, then its follow-ups, each with its own chance.
pub struct HttpProbe {
    client: Client,
    base_url: String,
    request: RequestSpec,
    follow_ups: Vec<FollowUpSpec>,
    /// Some follow-up reads the first response.
    needs_previous: bool,
}

impl HttpProbe {
    async fn send(
        &self,
        spec: &RequestSpec,
        ctx: &mut ProbeContext,
        previous: Option<&Value>,
        keep_body: bool,
    ) -> Result<(u16, Option<Value>), ProbeError> {
        let fail = |message: String| {
            ProbeError::new(message)
                .with_label("endpoint", spec.endpoint.clone())
                .with_label("method", spec.method.as_str())
        };

        let path = spec
            .path
            .render(ctx, previous)
            .map_err(|e| fail(e.to_string()).with_label("status", "template"))?;
        let mut request = self
            .client
            .request(spec.method.clone(), format!("{}{}", self.base_url, path));
        for (name, template) in &spec.headers {
            let value = template
                .render(ctx, previous)
                .map_err(|e| fail(e.to_string()).with_label("status", "template"))?;
            request = request.header(name.clone(), value);
        }
        if let Some(body) = &spec.body {
            let body = body
                .render(ctx, previous)
                .map_err(|e| fail(e.to_string()).with_label("status", "template"))?;
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await.map_err(|e| {
            let status = if e.is_timeout() { "timeout" } else { "error" };
            fail(format!("{} {}: {e}", spec.method, spec.endpoint)).with_label("status", status)
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            fail(format!("{} {}: reading body: {e}", spec.method, spec.endpoint))
                .with_label("status", status.to_string())
        })?;

        trace!(
            method = %spec.method,
            endpoint = %spec.endpoint,
            status,
            "HTTP response"
        );
        let body = (keep_body || spec.reads_body())
            .then(|| serde_json::from_slice(&body).unwrap_or(Value::Null));
        spec.tally(ctx, status, body.as_ref());

        if !spec.expect.contains(&status) {
            return Err(fail(format!(
                "{} {} returned {status}, expected one of {:?}",
                spec.method, spec.endpoint, spec.expect
            ))
            .with_label("status", status.to_string()));
        }
        Ok((status, body))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn call(&self, ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError> {
        let (status, previous) = self
            .send(&self.request, ctx, None, self.needs_previous)
            .await?;
        let report = ProbeReport::new()
            .with_label("endpoint", self.request.endpoint.clone())
            .with_label("method", self.request.method.as_str())
            .with_label("status", status.to_string());

        for follow_up in &self.follow_ups {
            if let Some(pointer) = &follow_up.when {
                if !holds_value(previous.as_ref(), pointer) {
                    continue;
                }
            }
            if !ctx.rng.gen_bool(follow_up.chance) {
                continue;
            }
            for _ in 0..follow_up.repeat.sample(&mut ctx.rng) {
                self.send(&follow_up.request, ctx, previous.as_ref(), false).await?;
            }
        }
        Ok(report)
    }

    fn metrics(&self) -> Vec<MetricDecl> {
        std::iter::once(&self.request)
            .chain(self.follow_ups.iter().map(|f| &f.request))
            .flat_map(|spec| &spec.count)
            .map(|rule| MetricDecl::new(rule.counter.clone(), MetricKind::Counter))
            .collect()
    }
}

fn header_pair(name: &str, value: &str) -> StrainResult<(HeaderName, HeaderValue)> {
    let header = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| StrainError::configuration(format!("bad header name `{name}`")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| StrainError::configuration(format!("bad value for header `{name}`")))?;
    Ok((header, value))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use strain_core::{DatasetConfig, Datasets, FollowUp, MetricSink};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answers every connection with `status` and `body`, returning request heads.
    async fn serve(status: u16, body: &'static str) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let _ = tx.send(head.lines().next().unwrap_or_default().to_string());
                    let response = format!(
                        "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{addr}/api"), rx)
    }

    fn run_config(base_url: &str) -> RunConfig {
        let mut run = RunConfig::default();
        run.http.base_url = base_url.to_string();
        run.datasets.insert(
            "movies".to_string(),
            DatasetConfig {
                path: "movies.txt".into(),
                optional: true,
            },
        );
        run
    }

    fn ctx() -> ProbeContext {
        ctx_with(Arc::new(MetricSink::new()))
    }

    fn ctx_with(sink: Arc<MetricSink>) -> ProbeContext {
        let mut ctx = ProbeContext::new(
            1,
            Arc::from("test"),
            Datasets::default(),
            StdRng::seed_from_u64(5),
            sink,
        );
        ctx.identity = Some("u-1".to_string());
        ctx
    }

    fn counter(sink: &MetricSink, name: &str) -> u64 {
        sink.snapshot().counter(name, &Labels::new())
    }

    /// A feed page with a cursor follow-up guarded on `/nextCursor`.
    fn paged_feed() -> ActionConfig {
        let mut feed = action("/feed?userId={user}");
        feed.request.count = vec![
            CountRule {
                counter: "feed_with_items".to_string(),
                status: vec![200],
                when: Some("/items/0".to_string()),
                unless: None,
            },
            CountRule {
                counter: "feed_empty_results".to_string(),
                status: Vec::new(),
                when: None,
                unless: Some("/items/0".to_string()),
            },
        ];
        let mut next_page = RequestConfig::get("/feed?userId={user}&cursor={prev:/nextCursor}");
        next_page.count = vec![CountRule {
            counter: "cursor_pagination_success".to_string(),
            status: vec![200],
            when: None,
            unless: None,
        }];
        let mut follow_up = FollowUp::new(next_page);
        follow_up.when = Some("/nextCursor".to_string());
        feed.then.push(follow_up);
        feed
    }

    fn action(path: &str) -> ActionConfig {
        ActionConfig {
            request: RequestConfig::get(path),
            then: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_request_is_labelled() {
        let (base_url, mut heads) = serve(200, r#"{"items": []}"#).await;
        let run = run_config(&base_url);
        let factory = HttpProbeFactory::new(&run.http).unwrap();
        let mut request = action("/feed?userId={user}");
        request.request.endpoint = Some("/feed".to_string());
        let probe = factory.build("browse_feed", &request, &run).unwrap();

        let report = probe.call(&mut ctx()).await.unwrap();
        assert_eq!(report.labels["endpoint"], "/feed");
        assert_eq!(report.labels["method"], "GET");
        assert_eq!(report.labels["status"], "200");
        assert_eq!(heads.recv().await.unwrap(), "GET /api/feed?userId=u-1 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_unexpected_status_is_probe_error() {
        let (base_url, _heads) = serve(500, "{}").await;
        let run = run_config(&base_url);
        let probe = HttpProbeFactory::new(&run.http)
            .unwrap()
            .build("movie", &action("/movies/1"), &run)
            .unwrap();

        let err = probe.call(&mut ctx()).await.unwrap_err();
        assert_eq!(err.labels["status"], "500");
        assert!(err.message.contains("returned 500"));
    }

    #[tokio::test]
    async fn test_follow_up_uses_previous_response() {
        let (base_url, mut heads) = serve(201, r#"{"id": 77}"#).await;
        let run = run_config(&base_url);
        let mut create = action("/reviews");
        create.request.method = "POST".to_string();
        create.request.body = Some(r#"{"text": "{words:3}"}"#.to_string());
        create.request.expect = vec![201];
        create.then.push(FollowUp::new(RequestConfig {
            expect: vec![201],
            ..RequestConfig::get("/reviews/{prev:/id}")
        }));
        let probe = HttpProbeFactory::new(&run.http)
            .unwrap()
            .build("create_review", &create, &run)
            .unwrap();

        probe.call(&mut ctx()).await.unwrap();
        assert_eq!(heads.recv().await.unwrap(), "POST /api/reviews HTTP/1.1");
        assert_eq!(heads.recv().await.unwrap(), "GET /api/reviews/77 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_guarded_follow_up_skipped_without_cursor() {
        let (base_url, mut heads) = serve(200, r#"{"items": []}"#).await;
        let run = run_config(&base_url);
        let probe = HttpProbeFactory::new(&run.http)
            .unwrap()
            .build("browse_feed", &paged_feed(), &run)
            .unwrap();
        let sink = Arc::new(MetricSink::new());

        probe.call(&mut ctx_with(sink.clone())).await.unwrap();
        assert_eq!(heads.recv().await.unwrap(), "GET /api/feed?userId=u-1 HTTP/1.1");
        assert!(heads.try_recv().is_err());
        assert_eq!(counter(&sink, "feed_with_items"), 0);
        assert_eq!(counter(&sink, "feed_empty_results"), 1);
        assert_eq!(counter(&sink, "cursor_pagination_success"), 0);
    }

    #[tokio::test]
    async fn test_guarded_follow_up_repeats_when_cursor_present() {
        let (base_url, mut heads) =
            serve(200, r#"{"items": [{"id": 5}], "nextCursor": "c2"}"#).await;
        let run = run_config(&base_url);
        let mut feed = paged_feed();
        feed.then[0].repeat = IntRange::new(2, 2);
        let probe = HttpProbeFactory::new(&run.http)
            .unwrap()
            .build("browse_feed", &feed, &run)
            .unwrap();
        let sink = Arc::new(MetricSink::new());

        let names: Vec<String> = probe.metrics().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            ["feed_with_items", "feed_empty_results", "cursor_pagination_success"]
        );

        probe.call(&mut ctx_with(sink.clone())).await.unwrap();
        assert_eq!(heads.recv().await.unwrap(), "GET /api/feed?userId=u-1 HTTP/1.1");
        for _ in 0..2 {
            assert_eq!(
                heads.recv().await.unwrap(),
                "GET /api/feed?userId=u-1&cursor=c2 HTTP/1.1"
            );
        }
        assert_eq!(counter(&sink, "feed_with_items"), 1);
        assert_eq!(counter(&sink, "feed_empty_results"), 0);
        assert_eq!(counter(&sink, "cursor_pagination_success"), 2);
    }

    #[test]
    fn test_holds_value_treats_empty_as_missing() {
        let body = serde_json::json!({
            "cursor": "", "items": [], "meta": {}, "done": false, "next": null,
            "page": 0, "id": "x", "list": [1],
        });
        for pointer in ["/cursor", "/items", "/meta", "/done", "/next", "/absent"] {
            assert!(!holds_value(Some(&body), pointer), "{pointer}");
        }
        for pointer in ["/page", "/id", "/list", "/list/0"] {
            assert!(holds_value(Some(&body), pointer), "{pointer}");
        }
        assert!(!holds_value(None, "/id"));
    }

    #[test]
    fn test_undeclared_dataset_is_rejected() {
        let run = run_config("http://localhost:1/api");
        let factory = HttpProbeFactory::new(&run.http).unwrap();

        assert!(factory.build("a", &action("/movies/{ds:movies}"), &run).is_ok());
        let err = factory
            .build("b", &action("/persons/{ds:persons}"), &run)
            .err()
            .unwrap();
        assert!(err.to_string().contains("action `b`"));
        assert!(err.to_string().contains("persons"));
    }

    #[test]
    fn test_prev_in_primary_request_is_rejected() {
        let run = run_config("http://localhost:1/api");
        let factory = HttpProbeFactory::new(&run.http).unwrap();
        assert!(factory.build("a", &action("/x/{prev:/id}"), &run).is_err());
    }
}

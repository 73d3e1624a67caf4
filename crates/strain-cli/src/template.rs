//! Request templates
//!
//! Paths, header values and bodies may embed placeholders that are expanded
//! on every request:
//!
//! | placeholder        | expands to                                   |
//! |--------------------|----------------------------------------------|
//! | `{user}`           | identity drawn for the current iteration     |
//! | `{vu}`, `{iter}`   | VU id, iteration index                       |
//! | `{seq:START:STRIDE}` | `START + (vu - 1) + iter * STRIDE`         |
//! | `{ds:NAME}`        | random element of dataset `NAME`             |
//! | `{int:A:B}`        | uniform integer in `[A, B]`                  |
//! | `{pick:a\|b\|c}`   | uniform choice                               |
//! | `{words:N}`        | `N` random review words                      |
//! | `{date:Y1:Y2}`     | random ISO date between Jan 1 Y1 and Dec 31 Y2 |
//! | `{bool:P}`         | `true` with probability `P`                  |
//! | `{prev:/pointer}`  | JSON pointer into the action's first response |
//!
//! Braces that do not form a known placeholder are copied as-is, so JSON
//! bodies need no escaping.

use chrono::{Duration as DateSpan, NaiveDate};
use rand::seq::SliceRandom;
use rand::Rng;
use strain_core::{StrainError, StrainResult};
use strain_engine::ProbeContext;
use thiserror::Error;

const REVIEW_WORDS: [&str; 20] = [
    "great",
    "movie",
    "amazing",
    "story",
    "characters",
    "acting",
    "loved",
    "perfect",
    "beautiful",
    "incredible",
    "masterpiece",
    "boring",
    "slow",
    "exciting",
    "thrilling",
    "emotional",
    "funny",
    "sad",
    "epic",
    "classic",
];

const KEYWORDS: [&str; 11] = [
    "user", "vu", "iter", "seq", "ds", "int", "pick", "words", "date", "bool", "prev",
];

/// A placeholder that could not be expanded for one request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("`{{user}}` used but the scenario draws no identity")]
    NoIdentity,

    #[error("dataset `{0}` is empty or not loaded")]
    EmptyDataset(String),

    #[error("`{{prev:{0}}}` used without a previous response")]
    NoPreviousResponse(String),

    #[error("previous response has no value at `{0}`")]
    MissingPointer(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    User,
    Vu,
    Iteration,
    /// Start and stride of a per-VU interleaved id sequence.
    Sequence(i64, i64),
    Dataset(String),
    Int(i64, i64),
    Pick(Vec<String>),
    Words(usize),
    Date(NaiveDate, i64),
    Bool(f64),
    Previous(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> StrainResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let candidate = after
                .find('}')
                .map(|close| &after[..close])
                .filter(|inner| is_placeholder(inner));

            match candidate {
                Some(inner) => {
                    let segment = parse_placeholder(inner).map_err(|reason| {
                        StrainError::configuration(format!(
                            "invalid placeholder `{{{inner}}}` in `{source}`: {reason}"
                        ))
                    })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                    rest = &after[inner.len() + 1..];
                }
                None => {
                    literal.push('{');
                    rest = after;
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Datasets referenced through `{ds:NAME}`.
    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Dataset(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// True when the template needs a previous response.
    pub fn uses_previous(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Previous(_)))
    }

    pub fn render(
        &self,
        ctx: &mut ProbeContext,
        previous: Option<&serde_json::Value>,
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::User => {
                    let user = ctx.identity.as_deref().ok_or(TemplateError::NoIdentity)?;
                    out.push_str(user);
                }
                Segment::Vu => out.push_str(&ctx.vu.to_string()),
                Segment::Iteration => out.push_str(&ctx.iteration.to_string()),
                Segment::Sequence(start, stride) => {
                    let id = i128::from(*start) + i128::from(ctx.vu) - 1
                        + i128::from(ctx.iteration) * i128::from(*stride);
                    out.push_str(&id.to_string());
                }
                Segment::Dataset(name) => {
                    let value = ctx
                        .sample(name)
                        .ok_or_else(|| TemplateError::EmptyDataset(name.clone()))?;
                    out.push_str(&value);
                }
                Segment::Int(min, max) => {
                    out.push_str(&ctx.rng.gen_range(*min..=*max).to_string());
                }
                Segment::Pick(options) => {
                    if let Some(choice) = options.choose(&mut ctx.rng) {
                        out.push_str(choice);
                    }
                }
                Segment::Words(count) => {
                    let words: Vec<&str> = (0..*count)
                        .filter_map(|_| REVIEW_WORDS.choose(&mut ctx.rng).copied())
                        .collect();
                    out.push_str(&words.join(" "));
                }
                Segment::Date(start, span_days) => {
                    let offset = ctx.rng.gen_range(0..=*span_days);
                    let date = *start + DateSpan::days(offset);
                    out.push_str(&date.format("%Y-%m-%d").to_string());
                }
                Segment::Bool(p) => {
                    out.push_str(if ctx.rng.gen_bool(*p) { "true" } else { "false" });
                }
                Segment::Previous(pointer) => {
                    let value = previous
                        .ok_or_else(|| TemplateError::NoPreviousResponse(pointer.clone()))?
                        .pointer(pointer)
                        .ok_or_else(|| TemplateError::MissingPointer(pointer.clone()))?;
                    match value {
                        serde_json::Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

/// `keyword` or `keyword:args`, with a known keyword and no JSON punctuation.
fn is_placeholder(inner: &str) -> bool {
    let keyword = inner.split(':').next().unwrap_or_default();
    KEYWORDS.contains(&keyword) && !inner.contains(['{', '"', '\n'])
}

fn parse_placeholder(inner: &str) -> Result<Segment, String> {
    let (keyword, args) = match inner.split_once(':') {
        Some((keyword, args)) => (keyword, Some(args)),
        None => (inner, None),
    };

    match (keyword, args) {
        ("user", None) => Ok(Segment::User),
        ("vu", None) => Ok(Segment::Vu),
        ("iter", None) => Ok(Segment::Iteration),
        ("seq", Some(args)) => {
            let (start, stride) = two_args::<i64>(args)?;
            if stride < 1 {
                return Err("stride must be at least 1".to_string());
            }
            Ok(Segment::Sequence(start, stride))
        }
        ("ds", Some(name)) if !name.trim().is_empty() => {
            Ok(Segment::Dataset(name.trim().to_string()))
        }
        ("int", Some(args)) => {
            let (min, max) = two_args::<i64>(args)?;
            if min > max {
                return Err(format!("{min} > {max}"));
            }
            Ok(Segment::Int(min, max))
        }
        ("pick", Some(args)) => {
            let options: Vec<String> = args.split('|').map(str::to_string).collect();
            if options.iter().all(String::is_empty) {
                return Err("no options".to_string());
            }
            Ok(Segment::Pick(options))
        }
        ("words", Some(count)) => count
            .trim()
            .parse::<usize>()
            .map(Segment::Words)
            .map_err(|e| e.to_string()),
        ("date", Some(args)) => {
            let (from, to) = two_args::<i32>(args)?;
            let start = NaiveDate::from_ymd_opt(from, 1, 1)
                .ok_or_else(|| format!("year {from} out of range"))?;
            let end = NaiveDate::from_ymd_opt(to, 12, 31)
                .ok_or_else(|| format!("year {to} out of range"))?;
            if end < start {
                return Err(format!("{from} > {to}"));
            }
            Ok(Segment::Date(start, (end - start).num_days()))
        }
        ("bool", Some(p)) => {
            let p: f64 = p.trim().parse().map_err(|_| format!("`{p}` is not a number"))?;
            if !(0.0..=1.0).contains(&p) {
                return Err("probability must be within [0, 1]".to_string());
            }
            Ok(Segment::Bool(p))
        }
        ("prev", Some(pointer)) if pointer.is_empty() || pointer.starts_with('/') => {
            Ok(Segment::Previous(pointer.to_string()))
        }
        ("prev", Some(_)) => Err("JSON pointer must start with `/`".to_string()),
        (_, None) => Err("missing arguments".to_string()),
        (_, Some(_)) => Err("unexpected arguments".to_string()),
    }
}

fn two_args<T: std::str::FromStr>(args: &str) -> Result<(T, T), String> {
    let (a, b) = args
        .split_once(':')
        .ok_or_else(|| format!("expected two arguments, got `{args}`"))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<T>()
            .map_err(|_| format!("`{s}` is not a number"))
    };
    Ok((parse(a)?, parse(b)?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use strain_core::{Dataset, Datasets, MetricSink};

    use super::*;

    fn ctx() -> ProbeContext {
        let datasets = Datasets::new([Dataset::from_lines("movies", ["m-1", "m-2"])]);
        let mut ctx = ProbeContext::new(
            4,
            Arc::from("feed"),
            datasets,
            StdRng::seed_from_u64(11),
            Arc::new(MetricSink::new()),
        );
        ctx.identity = Some("user-42".to_string());
        ctx.iteration = 7;
        ctx
    }

    #[test]
    fn test_json_body_braces_survive() {
        let template =
            Template::parse(r#"{"userId": "{user}", "rating": {int:1:5}, "vu": {vu}}"#).unwrap();
        let rendered = template.render(&mut ctx(), None).unwrap();

        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["userId"], "user-42");
        let rating = value["rating"].as_i64().unwrap();
        assert!((1..=5).contains(&rating));
        assert_eq!(value["vu"], 4);
    }

    #[test]
    fn test_dataset_and_iteration() {
        let template = Template::parse("/movies/{ds:movies}/page?i={iter}").unwrap();
        assert_eq!(template.datasets().collect::<Vec<_>>(), vec!["movies"]);

        let rendered = template.render(&mut ctx(), None).unwrap();
        assert!(
            rendered == "/movies/m-1/page?i=7" || rendered == "/movies/m-2/page?i=7",
            "{rendered}"
        );
    }

    #[test]
    fn test_sequence_interleaves_vus() {
        let template = Template::parse("/persons/{seq:100:10}/page").unwrap();
        let mut ctx = ctx();

        // VU 4, iteration 7.
        assert_eq!(template.render(&mut ctx, None).unwrap(), "/persons/173/page");

        let mut seen = Vec::new();
        for vu in 1..=10 {
            ctx.vu = vu;
            for iteration in 0..3 {
                ctx.iteration = iteration;
                seen.push(template.render(&mut ctx, None).unwrap());
            }
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 30);
        assert!(seen.contains(&"/persons/100/page".to_string()));
        assert!(seen.contains(&"/persons/129/page".to_string()));

        assert!(Template::parse("{seq:1:0}").is_err());
    }

    #[test]
    fn test_random_generators_stay_in_range() {
        let mut ctx = ctx();
        let date = Template::parse("{date:2020:2024}").unwrap();
        let words = Template::parse("{words:6}").unwrap();
        let pick = Template::parse("{pick:PUBLIC|PRIVATE}").unwrap();
        let flag = Template::parse("{bool:0}").unwrap();

        for _ in 0..50 {
            let d = NaiveDate::parse_from_str(&date.render(&mut ctx, None).unwrap(), "%Y-%m-%d")
                .unwrap();
            assert!(d >= NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
            assert!(d <= NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());

            let text = words.render(&mut ctx, None).unwrap();
            assert_eq!(text.split(' ').count(), 6);
            assert!(text.split(' ').all(|w| REVIEW_WORDS.contains(&w)));

            let choice = pick.render(&mut ctx, None).unwrap();
            assert!(choice == "PUBLIC" || choice == "PRIVATE");
            assert_eq!(flag.render(&mut ctx, None).unwrap(), "false");
        }
    }

    #[test]
    fn test_previous_response_pointer() {
        let template = Template::parse("/reviews/{prev:/data/id}/like").unwrap();
        assert!(template.uses_previous());

        let previous = serde_json::json!({ "data": { "id": 981 } });
        let rendered = template.render(&mut ctx(), Some(&previous)).unwrap();
        assert_eq!(rendered, "/reviews/981/like");

        assert_eq!(
            template.render(&mut ctx(), None).unwrap_err(),
            TemplateError::NoPreviousResponse("/data/id".to_string())
        );
    }

    #[test]
    fn test_render_errors() {
        let mut ctx = ctx();
        ctx.identity = None;
        let user = Template::parse("/feed?userId={user}").unwrap();
        assert_eq!(user.render(&mut ctx, None).unwrap_err(), TemplateError::NoIdentity);

        let missing = Template::parse("{ds:persons}").unwrap();
        assert_eq!(
            missing.render(&mut ctx, None).unwrap_err(),
            TemplateError::EmptyDataset("persons".to_string())
        );
    }

    #[test]
    fn test_invalid_placeholders_are_configuration_errors() {
        for source in [
            "{int:5:1}", "{int:a:b}", "{bool:2}", "{words:x}", "{ds:}", "{user:1}", "{seq:1}",
        ] {
            let err = Template::parse(source).unwrap_err();
            assert!(err.is_configuration(), "{source}");
        }
        assert_eq!(
            Template::parse("{unknown}").unwrap().render(&mut ctx(), None).unwrap(),
            "{unknown}"
        );
    }
}

// Property-based tests for weighted action selection
//
// Properties tested:
// 1. A draw selects the action whose cumulative interval owns it
// 2. Selection frequencies converge to weight / total
// 3. Reweighting never changes the number of selectable actions

use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use strain_engine::{ActionRegistry, Probe, ProbeContext, ProbeError, ProbeReport};

struct Noop;

#[async_trait]
impl Probe for Noop {
    async fn call(&self, _ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError> {
        Ok(ProbeReport::new())
    }
}

fn registry(weights: &[f64]) -> ActionRegistry {
    let registry = ActionRegistry::new();
    for (i, weight) in weights.iter().enumerate() {
        registry
            .register(format!("action_{i}"), *weight, Arc::new(Noop))
            .unwrap();
    }
    registry
}

fn index_of(name: &str) -> usize {
    name.trim_start_matches("action_").parse().unwrap()
}

proptest! {
    #[test]
    fn prop_draw_selects_owning_interval(
        weights in prop::collection::vec(0.01f64..100.0, 1..10),
        fraction in 0.0f64..1.0,
    ) {
        let table = registry(&weights).current();
        let draw = fraction * table.total_weight();
        let selected = index_of(&table.select_at(draw).unwrap().name);

        let mut upper = 0.0;
        let mut expected = weights.len() - 1;
        for (i, weight) in weights.iter().enumerate() {
            upper += weight;
            if draw <= upper {
                expected = i;
                break;
            }
        }
        prop_assert_eq!(selected, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_frequencies_converge(
        weights in prop::collection::vec(1.0f64..10.0, 2..5),
        seed in any::<u64>(),
    ) {
        const DRAWS: usize = 20_000;
        let table = registry(&weights).current();
        let total: f64 = weights.iter().sum();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut hits = vec![0usize; weights.len()];
        for _ in 0..DRAWS {
            hits[index_of(&table.select_weighted(&mut rng).unwrap().name)] += 1;
        }
        for (i, weight) in weights.iter().enumerate() {
            let share = hits[i] as f64 / DRAWS as f64;
            let expected = weight / total;
            prop_assert!(
                (share - expected).abs() < 0.03,
                "action {} share {} expected {}", i, share, expected
            );
        }
    }

    #[test]
    fn prop_reweight_keeps_actions(
        weights in prop::collection::vec(0.5f64..10.0, 1..6),
        new_weight in 0.01f64..50.0,
    ) {
        let registry = registry(&weights);
        registry.reweight("action_0", new_weight).unwrap();

        let table = registry.current();
        prop_assert_eq!(table.actions().len(), weights.len());
        let total: f64 = weights[1..].iter().sum::<f64>() + new_weight;
        prop_assert!((table.total_weight() - total).abs() < 1e-9);
    }
}

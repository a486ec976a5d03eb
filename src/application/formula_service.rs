// Formula service - Chain resolution and sandboxed series computation
use crate::application::evaluator::ExpressionEvaluator;
use crate::application::formula_repository::FormulaRepository;
use crate::domain::formula::{
    FormulaChain, FormulaComputation, FormulaSelector, FormulaStep, StepOutput,
};
use crate::domain::series::{ComputedPoint, Point};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct FormulaService {
    repository: Arc<dyn FormulaRepository>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    batch_width: usize,
}

impl FormulaService {
    pub fn new(
        repository: Arc<dyn FormulaRepository>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        batch_width: usize,
    ) -> Self {
        Self {
            repository,
            evaluator,
            batch_width: batch_width.max(1),
        }
    }

    /// Reconstructs the ordered calibration chain ending at the target
    /// formula: the enabled group's steps from the start of the group up to
    /// and including the target.
    pub async fn resolve_chain(
        &self,
        selector: &FormulaSelector,
    ) -> CoreResult<FormulaChain> {
        let target = self
            .repository
            .find_formula(selector)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("formula {selector} not found")))?;

        let membership = self
            .repository
            .find_enabled_membership(target.id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "formula \"{}\" has no enabled group membership",
                    target.name
                ))
            })?;

        let rows = self
            .repository
            .list_enabled_memberships(membership.group_id)
            .await?;

        // Unreachable given the membership lookup above, but checked: the
        // group listing must still contain the target.
        let target_index = rows
            .iter()
            .position(|row| row.formula_id == target.id)
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "formula \"{}\" missing from group \"{}\" chain",
                    target.name, membership.group_name
                ))
            })?;

        let steps = rows
            .into_iter()
            .take(target_index + 1)
            .map(|row| FormulaStep {
                id: row.formula_id,
                name: row.name,
                unit: row.unit,
                sequence: row.sequence,
                expression: row.expression,
            })
            .collect();

        Ok(FormulaChain {
            group_id: membership.group_id,
            group_name: membership.group_name,
            target_id: target.id,
            steps,
        })
    }

    /// Runs the resolved chain against a single starting value, keeping the
    /// per-step outputs.
    pub async fn compute_value(
        &self,
        selector: &FormulaSelector,
        input: f64,
        variables: &HashMap<String, f64>,
    ) -> CoreResult<FormulaComputation> {
        if !input.is_finite() {
            return Err(CoreError::Validation(
                "input must be a finite number".to_string(),
            ));
        }

        let chain = self.resolve_chain(selector).await?;
        let steps = self.run_chain(&chain, input, variables).await?;
        let output = steps.last().map(|step| step.output).unwrap_or(input);

        Ok(FormulaComputation {
            target_id: chain.target_id,
            group_id: chain.group_id,
            unit: chain.unit().map(str::to_string),
            group_name: chain.group_name,
            input,
            steps,
            output,
        })
    }

    /// Applies an already-resolved chain to every point of a raw series,
    /// preserving order and null-propagation, in fixed-width concurrent
    /// batches. Callers resolve the chain once and reuse it for metadata.
    pub async fn compute_series(
        &self,
        chain: &FormulaChain,
        points: &[Point],
        variables: &HashMap<String, f64>,
    ) -> CoreResult<Vec<ComputedPoint>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let mut computed = Vec::with_capacity(points.len());
        for batch in points.chunks(self.batch_width) {
            // join_all keeps input order, so assembly is index-preserving
            // regardless of intra-batch completion order.
            let results = futures::future::join_all(
                batch
                    .iter()
                    .map(|point| self.compute_point(chain, point, variables)),
            )
            .await;
            for result in results {
                computed.push(result?);
            }
        }

        Ok(computed)
    }

    async fn compute_point(
        &self,
        chain: &FormulaChain,
        point: &Point,
        variables: &HashMap<String, f64>,
    ) -> CoreResult<ComputedPoint> {
        // Null or non-finite raws short-circuit without touching the
        // evaluator.
        let Some(raw) = point.value.filter(|value| value.is_finite()) else {
            return Ok(ComputedPoint {
                timestamp: point.timestamp,
                raw: point.value,
                value: None,
            });
        };

        let steps = self.run_chain(chain, raw, variables).await?;
        let output = steps.last().map(|step| step.output).unwrap_or(raw);

        Ok(ComputedPoint {
            timestamp: point.timestamp,
            raw: point.value,
            value: Some(output),
        })
    }

    async fn run_chain(
        &self,
        chain: &FormulaChain,
        input: f64,
        variables: &HashMap<String, f64>,
    ) -> CoreResult<Vec<StepOutput>> {
        let mut value = input;
        let mut outputs = Vec::with_capacity(chain.steps.len());

        for step in &chain.steps {
            // Each step sees the running value plus the caller's auxiliary
            // variables; auxiliaries may shadow `value`, which is accepted
            // caller-controlled behavior.
            let mut scope = HashMap::with_capacity(variables.len() + 1);
            scope.insert("value".to_string(), value);
            scope.extend(variables.iter().map(|(k, v)| (k.clone(), *v)));

            value = self
                .evaluator
                .evaluate(&step.expression, &scope)
                .await
                .map_err(|err| CoreError::Formula {
                    step: step.name.clone(),
                    reason: err.to_string(),
                })?;

            outputs.push(StepOutput {
                id: step.id,
                name: step.name.clone(),
                sequence: step.sequence,
                output: value,
            });
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::evaluator::EvalError;
    use crate::application::formula_repository::{FormulaRef, GroupMembership, MembershipRow};
    use crate::infrastructure::expression::SandboxEvaluator;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// In-memory formula store: one group ("calibration", id 10) holding the
    /// doubling and increment formulas, plus an orphan formula without any
    /// enabled membership and a formula linked to two enabled groups.
    struct StaticFormulaStore;

    #[async_trait]
    impl FormulaRepository for StaticFormulaStore {
        async fn find_formula(
            &self,
            selector: &FormulaSelector,
        ) -> anyhow::Result<Option<FormulaRef>> {
            let known = [
                (1, "double"),
                (2, "increment"),
                (3, "orphan"),
                (4, "shared"),
            ];
            Ok(known
                .iter()
                .find(|(id, name)| match selector {
                    FormulaSelector::Id(wanted) => wanted == id,
                    FormulaSelector::Name(wanted) => wanted == name,
                })
                .map(|(id, name)| FormulaRef {
                    id: *id,
                    name: name.to_string(),
                }))
        }

        async fn find_enabled_membership(
            &self,
            formula_id: i64,
        ) -> anyhow::Result<Option<GroupMembership>> {
            Ok(match formula_id {
                1 => Some(GroupMembership {
                    group_id: 10,
                    group_name: "calibration".to_string(),
                    sequence: 1,
                }),
                2 => Some(GroupMembership {
                    group_id: 10,
                    group_name: "calibration".to_string(),
                    sequence: 2,
                }),
                // Belongs to groups with sequences 3 and 7; the deepest
                // membership wins.
                4 => Some(GroupMembership {
                    group_id: 20,
                    group_name: "deep".to_string(),
                    sequence: 7,
                }),
                _ => None,
            })
        }

        async fn list_enabled_memberships(
            &self,
            group_id: i64,
        ) -> anyhow::Result<Vec<MembershipRow>> {
            Ok(match group_id {
                10 => vec![
                    MembershipRow {
                        formula_id: 1,
                        name: "double".to_string(),
                        unit: Some("V".to_string()),
                        sequence: 1,
                        expression: "value * 2".to_string(),
                    },
                    MembershipRow {
                        formula_id: 2,
                        name: "increment".to_string(),
                        unit: Some("NTU".to_string()),
                        sequence: 2,
                        expression: "value + 1".to_string(),
                    },
                ],
                20 => vec![MembershipRow {
                    formula_id: 4,
                    name: "shared".to_string(),
                    unit: None,
                    sequence: 7,
                    expression: "value".to_string(),
                }],
                _ => vec![],
            })
        }
    }

    /// Counts evaluator invocations to assert the null short-circuit.
    struct CountingEvaluator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExpressionEvaluator for CountingEvaluator {
        async fn evaluate(
            &self,
            _expression: &str,
            scope: &HashMap<String, f64>,
        ) -> Result<f64, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(scope["value"])
        }
    }

    fn service() -> FormulaService {
        FormulaService::new(
            Arc::new(StaticFormulaStore),
            Arc::new(SandboxEvaluator::new(200)),
            8,
        )
    }

    #[tokio::test]
    async fn chain_is_truncated_at_the_target() {
        let chain = service()
            .resolve_chain(&FormulaSelector::Id(1))
            .await
            .unwrap();
        assert_eq!(chain.group_id, 10);
        assert_eq!(chain.target_id, 1);
        assert_eq!(chain.steps.len(), 1);
        assert_eq!(chain.steps[0].name, "double");
    }

    #[tokio::test]
    async fn chain_resolves_by_name_too() {
        let chain = service()
            .resolve_chain(&FormulaSelector::Name("increment".to_string()))
            .await
            .unwrap();
        assert_eq!(chain.target_id, 2);
        assert_eq!(chain.steps.len(), 2);
        assert!(chain.steps.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(chain.unit(), Some("NTU"));
    }

    #[tokio::test]
    async fn multi_group_membership_picks_the_highest_sequence() {
        let chain = service()
            .resolve_chain(&FormulaSelector::Id(4))
            .await
            .unwrap();
        assert_eq!(chain.group_id, 20);
        assert_eq!(chain.group_name, "deep");
    }

    #[tokio::test]
    async fn unknown_formula_is_not_found() {
        let err = service()
            .resolve_chain(&FormulaSelector::Id(99))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn formula_without_enabled_group_is_not_found() {
        let err = service()
            .resolve_chain(&FormulaSelector::Id(3))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn compute_value_folds_the_chain() {
        let result = service()
            .compute_value(&FormulaSelector::Id(2), 3.0, &HashMap::new())
            .await
            .unwrap();
        // value * 2 = 6, then value + 1 = 7
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].output, 6.0);
        assert_eq!(result.steps[1].output, 7.0);
        assert_eq!(result.output, 7.0);
        assert_eq!(result.unit.as_deref(), Some("NTU"));
    }

    #[tokio::test]
    async fn compute_value_is_deterministic() {
        let service = service();
        let selector = FormulaSelector::Id(2);
        let first = service
            .compute_value(&selector, 3.0, &HashMap::new())
            .await
            .unwrap();
        let second = service
            .compute_value(&selector, 3.0, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(first.output, second.output);
    }

    #[tokio::test]
    async fn compute_value_rejects_non_finite_input() {
        let err = service()
            .compute_value(&FormulaSelector::Id(2), f64::NAN, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn compute_series_propagates_nulls_in_order() {
        let points = vec![
            Point::new(ts(0), Some(5.0)),
            Point::new(ts(60), None),
            Point::new(ts(120), None),
        ];
        let service = service();
        let chain = service
            .resolve_chain(&FormulaSelector::Id(2))
            .await
            .unwrap();
        let computed = service
            .compute_series(&chain, &points, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(computed.len(), 3);
        assert_eq!(computed[0].value, Some(11.0)); // 5*2 + 1
        assert_eq!(computed[0].raw, Some(5.0));
        assert_eq!(computed[1].value, None);
        assert_eq!(computed[2].value, None);
        assert!(computed.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn null_points_never_reach_the_evaluator() {
        let evaluator = Arc::new(CountingEvaluator {
            calls: AtomicUsize::new(0),
        });
        let service = FormulaService::new(Arc::new(StaticFormulaStore), evaluator.clone(), 8);

        let points = vec![
            Point::new(ts(0), None),
            Point::new(ts(60), Some(f64::NAN)),
            Point::new(ts(120), Some(2.0)),
        ];
        let chain = service
            .resolve_chain(&FormulaSelector::Id(2))
            .await
            .unwrap();
        let computed = service
            .compute_series(&chain, &points, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(computed[0].value, None);
        assert_eq!(computed[1].value, None);
        assert_eq!(computed[2].value, Some(2.0));
        // Only the finite point's two chain steps ran.
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn order_survives_batching_on_long_series() {
        let points: Vec<Point> = (0..50).map(|i| Point::new(ts(i * 60), Some(i as f64))).collect();
        let service = service();
        let chain = service
            .resolve_chain(&FormulaSelector::Id(2))
            .await
            .unwrap();
        let computed = service
            .compute_series(&chain, &points, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(computed.len(), 50);
        for (i, point) in computed.iter().enumerate() {
            assert_eq!(point.timestamp, ts(i as i64 * 60));
            assert_eq!(point.value, Some(i as f64 * 2.0 + 1.0));
        }
    }

    #[tokio::test]
    async fn failing_step_is_fatal_and_names_the_step() {
        struct BrokenStore;

        #[async_trait]
        impl FormulaRepository for BrokenStore {
            async fn find_formula(
                &self,
                _selector: &FormulaSelector,
            ) -> anyhow::Result<Option<FormulaRef>> {
                Ok(Some(FormulaRef {
                    id: 1,
                    name: "broken".to_string(),
                }))
            }

            async fn find_enabled_membership(
                &self,
                _formula_id: i64,
            ) -> anyhow::Result<Option<GroupMembership>> {
                Ok(Some(GroupMembership {
                    group_id: 1,
                    group_name: "broken".to_string(),
                    sequence: 1,
                }))
            }

            async fn list_enabled_memberships(
                &self,
                _group_id: i64,
            ) -> anyhow::Result<Vec<MembershipRow>> {
                Ok(vec![MembershipRow {
                    formula_id: 1,
                    name: "broken".to_string(),
                    unit: None,
                    sequence: 1,
                    expression: "value / 0.0".to_string(),
                }])
            }
        }

        let service =
            FormulaService::new(Arc::new(BrokenStore), Arc::new(SandboxEvaluator::new(200)), 8);

        let err = service
            .compute_value(&FormulaSelector::Id(1), 1.0, &HashMap::new())
            .await
            .unwrap_err();
        match err {
            CoreError::Formula { step, .. } => assert_eq!(step, "broken"),
            other => panic!("expected a formula error, got {other:?}"),
        }

        // The same failure is fatal to a whole series computation.
        let chain = service
            .resolve_chain(&FormulaSelector::Id(1))
            .await
            .unwrap();
        let points = vec![Point::new(ts(0), Some(1.0))];
        let err = service
            .compute_series(&chain, &points, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Formula { .. }));
    }

    #[tokio::test]
    async fn auxiliary_variables_reach_the_expression() {
        struct AuxStore;

        #[async_trait]
        impl FormulaRepository for AuxStore {
            async fn find_formula(
                &self,
                _selector: &FormulaSelector,
            ) -> anyhow::Result<Option<FormulaRef>> {
                Ok(Some(FormulaRef {
                    id: 1,
                    name: "compensated".to_string(),
                }))
            }

            async fn find_enabled_membership(
                &self,
                _formula_id: i64,
            ) -> anyhow::Result<Option<GroupMembership>> {
                Ok(Some(GroupMembership {
                    group_id: 1,
                    group_name: "aux".to_string(),
                    sequence: 1,
                }))
            }

            async fn list_enabled_memberships(
                &self,
                _group_id: i64,
            ) -> anyhow::Result<Vec<MembershipRow>> {
                Ok(vec![MembershipRow {
                    formula_id: 1,
                    name: "compensated".to_string(),
                    unit: None,
                    sequence: 1,
                    expression: "value + temp * 0.5".to_string(),
                }])
            }
        }

        let service = FormulaService::new(Arc::new(AuxStore), Arc::new(SandboxEvaluator::new(200)), 8);
        let mut variables = HashMap::new();
        variables.insert("temp".to_string(), 24.0);

        let result = service
            .compute_value(&FormulaSelector::Id(1), 1.0, &variables)
            .await
            .unwrap();
        assert_eq!(result.output, 13.0);
    }
}

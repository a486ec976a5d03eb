// Formula chain domain models
use crate::error::CoreError;
use std::fmt;

/// How the caller names the target formula: by id or by exact name.
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaSelector {
    Id(i64),
    Name(String),
}

impl FormulaSelector {
    /// Builds a selector from optional request fields. Id wins when both are
    /// present; neither is a validation failure.
    pub fn from_parts(id: Option<i64>, name: Option<String>) -> Result<Self, CoreError> {
        match (id, name) {
            (Some(id), _) => Ok(Self::Id(id)),
            (None, Some(name)) if !name.trim().is_empty() => Ok(Self::Name(name)),
            _ => Err(CoreError::Validation(
                "formula_id or formula_name is required".to_string(),
            )),
        }
    }
}

impl fmt::Display for FormulaSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Name(name) => write!(f, "name \"{name}\""),
        }
    }
}

/// One calibration/unit-conversion step. `expression` is evaluated with the
/// running `value` plus any caller-supplied auxiliary variables in scope.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaStep {
    pub id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub sequence: i32,
    pub expression: String,
}

/// The ordered prefix of an enabled group's formulas, truncated at the
/// target. Steps after the target are never part of a chain.
#[derive(Debug, Clone)]
pub struct FormulaChain {
    pub group_id: i64,
    pub group_name: String,
    pub target_id: i64,
    pub steps: Vec<FormulaStep>,
}

impl FormulaChain {
    /// The unit of the chain's final step, if it declares one.
    pub fn unit(&self) -> Option<&str> {
        self.steps.last().and_then(|step| step.unit.as_deref())
    }
}

/// Intermediate result of one chain step during a value computation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub id: i64,
    pub name: String,
    pub sequence: i32,
    pub output: f64,
}

/// Full result of running a chain against a single input value, with the
/// per-step outputs kept for diagnostics.
#[derive(Debug, Clone)]
pub struct FormulaComputation {
    pub target_id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub unit: Option<String>,
    pub input: f64,
    pub steps: Vec<StepOutput>,
    pub output: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_requires_id_or_name() {
        let err = FormulaSelector::from_parts(None, None).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = FormulaSelector::from_parts(None, Some("  ".to_string())).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn selector_prefers_id_when_both_given() {
        let sel = FormulaSelector::from_parts(Some(25), Some("Turbidity".to_string())).unwrap();
        assert_eq!(sel, FormulaSelector::Id(25));
    }

    #[test]
    fn chain_unit_comes_from_the_last_step() {
        let chain = FormulaChain {
            group_id: 1,
            group_name: "turbidity".to_string(),
            target_id: 2,
            steps: vec![
                FormulaStep {
                    id: 1,
                    name: "volts".to_string(),
                    unit: Some("V".to_string()),
                    sequence: 1,
                    expression: "value".to_string(),
                },
                FormulaStep {
                    id: 2,
                    name: "ntu".to_string(),
                    unit: Some("NTU".to_string()),
                    sequence: 2,
                    expression: "value".to_string(),
                },
            ],
        };
        assert_eq!(chain.unit(), Some("NTU"));
    }
}

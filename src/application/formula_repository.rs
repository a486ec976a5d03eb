// Repository trait for the formula store
use crate::domain::formula::FormulaSelector;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct FormulaRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct GroupMembership {
    pub group_id: i64,
    pub group_name: String,
    pub sequence: i32,
}

/// One enabled group membership joined with its formula's details.
#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub formula_id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub sequence: i32,
    pub expression: String,
}

#[async_trait]
pub trait FormulaRepository: Send + Sync {
    /// Resolves the target formula by id or exact name.
    async fn find_formula(&self, selector: &FormulaSelector)
    -> anyhow::Result<Option<FormulaRef>>;

    /// The formula's enabled membership with the highest sequence. When a
    /// formula belongs to several enabled groups the deepest membership wins.
    async fn find_enabled_membership(
        &self,
        formula_id: i64,
    ) -> anyhow::Result<Option<GroupMembership>>;

    /// All enabled memberships of the group, ordered ascending by sequence.
    async fn list_enabled_memberships(
        &self,
        group_id: i64,
    ) -> anyhow::Result<Vec<MembershipRow>>;
}

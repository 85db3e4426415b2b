use serde::{Deserialize, Serialize};

/// One addressable recipient class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingTarget {
    User { id: String },
    Role { role: String },
    Room { id: String },
    All,
}

impl RoutingTarget {
    /// Short label for logs and error messages, e.g. `user:alice`.
    pub fn describe(&self) -> String {
        match self {
            Self::User { id } => format!("user:{id}"),
            Self::Role { role } => format!("role:{role}"),
            Self::Room { id } => format!("room:{id}"),
            Self::All => "all".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
}

/// A predicate over a subscriber's registered context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: ConditionOp, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate against a subscriber context. A missing field never matches,
    /// except under `Ne` where absence counts as "not equal".
    pub fn matches(&self, context: &serde_json::Value) -> bool {
        let actual = context.get(&self.field);
        match self.op {
            ConditionOp::Eq => actual == Some(&self.value),
            ConditionOp::Ne => actual != Some(&self.value),
            ConditionOp::Gt => match (actual.and_then(|v| v.as_f64()), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOp::Lt => match (actual.and_then(|v| v.as_f64()), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ConditionOp::Contains => match actual {
                Some(serde_json::Value::String(s)) => {
                    self.value.as_str().is_some_and(|needle| s.contains(needle))
                }
                Some(serde_json::Value::Array(items)) => items.contains(&self.value),
                _ => false,
            },
        }
    }
}

/// Where a message goes and under what constraints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub targets: Vec<RoutingTarget>,
    pub broadcast: bool,
    pub exclude_sender: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Routing {
    pub fn to_user(id: impl Into<String>) -> Self {
        Self {
            targets: vec![RoutingTarget::User { id: id.into() }],
            ..Self::default()
        }
    }

    pub fn to_role(role: impl Into<String>) -> Self {
        Self {
            targets: vec![RoutingTarget::Role { role: role.into() }],
            ..Self::default()
        }
    }

    pub fn to_room(id: impl Into<String>) -> Self {
        Self {
            targets: vec![RoutingTarget::Room { id: id.into() }],
            ..Self::default()
        }
    }

    pub fn to_all() -> Self {
        Self {
            targets: vec![RoutingTarget::All],
            broadcast: true,
            ..Self::default()
        }
    }

    /// All conditions must hold against the subscriber's context. Messages
    /// without conditions match everyone; conditioned messages fail closed
    /// against subscribers that registered no context.
    pub fn conditions_match(&self, context: Option<&serde_json::Value>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match context {
            Some(ctx) => self.conditions.iter().all(|c| c.matches(ctx)),
            None => false,
        }
    }
}

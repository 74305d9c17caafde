use crate::error::{FunnelError, Result};
use crate::query::QueryLimits;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Event name whose own identifier defines a session.
pub const SESSION_EVENT_NAME: &str = "$session";

/// Declarative funnel request: an ordered list of steps plus breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelSpec {
    pub project_id: i64,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub global_user_filters: Vec<PropertyFilter>,
    #[serde(default)]
    pub group_by: Vec<Dimension>,
    #[serde(default)]
    pub session_window: Option<SessionWindow>,
    pub time_range: TimeRange,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Emit average time between adjacent steps.
    #[serde(default)]
    pub step_time: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub event_name: String,
    #[serde(default)]
    pub filters: Vec<PropertyFilter>,
    /// Group the step's users must belong to.
    #[serde(default)]
    pub group: Option<String>,
}

impl Step {
    pub fn new(event_name: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            filters: Vec::new(),
            group: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Event,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEqual,
    Contains,
    NotContains,
    GreaterThan,
    LesserThan,
    GreaterThanOrEqual,
    LesserThanOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    #[default]
    And,
    Or,
}

/// A comparison against one event or user property.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyFilter {
    pub entity: Entity,
    pub property: String,
    pub operator: FilterOperator,
    pub value: String,
    /// How this filter combines with the previous one. Ignored on the first filter.
    #[serde(default)]
    pub logical_op: LogicalOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Categorical,
    Numeric,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

/// A group-by dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    pub index: usize,
    pub entity: Entity,
    /// Step whose event carries the property. Required for event dimensions.
    #[serde(default)]
    pub event_step_index: Option<usize>,
    pub name: String,
    pub value_kind: ValueKind,
    #[serde(default)]
    pub granularity: Option<Granularity>,
}

impl Dimension {
    pub fn user(index: usize, name: &str, value_kind: ValueKind) -> Self {
        Self {
            index,
            entity: Entity::User,
            event_step_index: None,
            name: name.to_string(),
            value_kind,
            granularity: None,
        }
    }

    pub fn event(index: usize, step: usize, name: &str, value_kind: ValueKind) -> Self {
        Self {
            index,
            entity: Entity::Event,
            event_step_index: Some(step),
            name: name.to_string(),
            value_kind,
            granularity: None,
        }
    }

    /// Whether the dimension is computed inside the stage of step `step`.
    pub fn is_scoped_to_step(&self, step: usize) -> bool {
        self.entity == Entity::Event && self.event_step_index == Some(step)
    }
}

/// Inclusive step range that must happen within a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWindow {
    pub start_step_index: usize,
    pub end_step_index: usize,
}

impl SessionWindow {
    pub const fn contains(&self, step: usize) -> bool {
        step >= self.start_step_index && step <= self.end_step_index
    }

    /// Whether both `step - 1` and `step` fall inside the window.
    pub const fn covers_pair(&self, step: usize) -> bool {
        step > 0 && self.contains(step - 1) && self.contains(step)
    }
}

/// Inclusive range of unix timestamps in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

impl FunnelSpec {
    /// Parse a spec from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FunnelError::InvalidSpec(e.to_string()))
    }

    /// Whether the step at `step` must carry a session identifier.
    pub fn tracks_session(&self, step: usize) -> bool {
        self.session_window.is_some_and(|w| w.contains(step))
    }

    /// Average step time is only meaningful with at least two steps.
    pub fn wants_step_time(&self) -> bool {
        self.step_time && self.steps.len() > 1
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Offset applied to timestamps before datetime truncation and labeling.
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_offset(&self.timezone)
            .ok_or_else(|| FunnelError::InvalidSpec(format!("unsupported timezone: {}", self.timezone)))
    }

    /// Validate the funnel against the configured limits.
    ///
    /// An empty step list is reported as a compile failure because the
    /// stage chain cannot be built at all; everything else is a client error.
    pub fn validate(&self, limits: &QueryLimits) -> Result<()> {
        if self.steps.is_empty() {
            return Err(FunnelError::CompileFailure(
                "funnel has no steps".to_string(),
            ));
        }
        if self.steps.len() > limits.max_steps {
            return Err(FunnelError::InvalidSpec(format!(
                "funnel has {} steps, at most {} are allowed",
                self.steps.len(),
                limits.max_steps
            )));
        }
        if self.time_range.from > self.time_range.to {
            return Err(FunnelError::InvalidSpec(
                "time range starts after it ends".to_string(),
            ));
        }
        self.offset()?;

        if let Some(window) = self.session_window {
            if window.start_step_index > window.end_step_index
                || window.end_step_index >= self.steps.len()
            {
                return Err(FunnelError::InvalidSpec(format!(
                    "session window {}..={} is outside the {} funnel steps",
                    window.start_step_index,
                    window.end_step_index,
                    self.steps.len()
                )));
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.event_name.trim().is_empty() {
                return Err(FunnelError::InvalidSpec(format!(
                    "step {i} has no event name"
                )));
            }
            for filter in &step.filters {
                validate_property_name(&filter.property)?;
            }
        }
        for filter in &self.global_user_filters {
            if filter.entity != Entity::User {
                return Err(FunnelError::InvalidSpec(format!(
                    "global filter on {} must target a user property",
                    filter.property
                )));
            }
            validate_property_name(&filter.property)?;
        }

        self.validate_dimensions()
    }

    fn validate_dimensions(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for dim in &self.group_by {
            if !seen.insert(dim.index) {
                return Err(FunnelError::InvalidDimension(format!(
                    "duplicate dimension index {}",
                    dim.index
                )));
            }
            validate_property_name(&dim.name)
                .map_err(|_| FunnelError::InvalidDimension(format!("invalid name {:?}", dim.name)))?;
            if dim.entity == Entity::Event {
                match dim.event_step_index {
                    Some(step) if step < self.steps.len() => {}
                    Some(step) => {
                        return Err(FunnelError::InvalidDimension(format!(
                            "{} references step {step} of a {}-step funnel",
                            dim.name,
                            self.steps.len()
                        )));
                    }
                    None => {
                        return Err(FunnelError::InvalidDimension(format!(
                            "event dimension {} has no step",
                            dim.name
                        )));
                    }
                }
            }
            if dim.granularity.is_some() && dim.value_kind != ValueKind::Datetime {
                return Err(FunnelError::InvalidDimension(format!(
                    "granularity is only valid on datetime dimension, not {}",
                    dim.name
                )));
            }
        }
        Ok(())
    }
}

/// Validate that a property name is safe to embed in a JSON path literal.
pub fn validate_property_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 256 {
        return Err(FunnelError::InvalidSpec(
            "property name must be 1 to 256 characters".to_string(),
        ));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | '-' | ' '));
    if !valid {
        return Err(FunnelError::InvalidSpec(format!(
            "property name {name:?} may only contain alphanumeric characters, '_', '$', '.', '-', ' '"
        )));
    }
    Ok(())
}

/// Parse `UTC` or a fixed `±HH:MM` offset.
pub fn parse_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

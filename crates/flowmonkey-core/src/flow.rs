//! Flow and step definitions
//!
//! A flow is an immutable template identified by `(id, version)`: a directed
//! graph of named steps connected by outcome-keyed transitions, plus any
//! data-store pipes it declares. Flow documents use camelCase field names on
//! the wire.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::pipe::Pipe;
use crate::selector::InputSelector;

/// Where an outcome routes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionTarget {
    /// Advance to the named step
    Next(String),

    /// Terminal sentinel (`null` in the flow document)
    End,
}

/// Outcome-keyed transition table of a step
///
/// Each entry distinguishes three cases: absent, declared `null` (the
/// terminal sentinel), and a target step id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transitions {
    #[serde(
        default,
        deserialize_with = "declared",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_success: Option<Option<String>>,

    #[serde(
        default,
        deserialize_with = "declared",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_failure: Option<Option<String>>,

    #[serde(
        default,
        deserialize_with = "declared",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_resume: Option<Option<String>>,
}

/// Distinguishes a declared `null` from an absent key: a present key always
/// deserializes to `Some(inner)`.
fn declared<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl Transitions {
    /// Success routing; absent and declared-null both terminate the flow
    pub fn success_target(&self) -> TransitionTarget {
        match self.on_success.as_ref().and_then(|t| t.as_ref()) {
            Some(step_id) => TransitionTarget::Next(step_id.clone()),
            None => TransitionTarget::End,
        }
    }

    /// Failure routing; `None` means the execution terminates failed
    pub fn failure_target(&self) -> Option<TransitionTarget> {
        match self.on_failure.as_ref()? {
            Some(step_id) => Some(TransitionTarget::Next(step_id.clone())),
            // Declared null routes nowhere, same as absent
            None => None,
        }
    }

    /// Resume routing; `None` means fall through to the success transition
    pub fn resume_target(&self) -> Option<TransitionTarget> {
        self.on_resume.as_ref().map(|t| match t {
            Some(step_id) => TransitionTarget::Next(step_id.clone()),
            None => TransitionTarget::End,
        })
    }

    /// All declared non-null targets (for graph validation)
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        [&self.on_success, &self.on_failure, &self.on_resume]
            .into_iter()
            .filter_map(|t| t.as_ref())
            .filter_map(|t| t.as_deref())
    }
}

/// A node in the flow graph, bound to a handler type and its config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step id, unique within the flow
    pub id: String,

    /// Handler type implementing this step
    #[serde(rename = "type")]
    pub step_type: String,

    /// Free-form handler configuration
    #[serde(default)]
    pub config: Map<String, Value>,

    /// How the handler input is derived from the context
    #[serde(default)]
    pub input: InputSelector,

    /// Context key receiving the handler output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,

    /// Outcome-keyed routing
    #[serde(default)]
    pub transitions: Transitions,
}

/// An immutable flow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Flow id
    pub id: String,

    /// Semver version string
    pub version: String,

    /// Entry step id
    pub initial_step_id: String,

    /// Steps keyed by id
    pub steps: HashMap<String, Step>,

    /// Declared data-store pipes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipes: Vec<Pipe>,
}

impl Flow {
    /// Look up a step by id
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Pipes declared for a step
    pub fn pipes_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Pipe> + 'a {
        self.pipes.iter().filter(move |p| p.step_id == step_id)
    }
}

//! Trust policy evaluated before every image copy.
//!
//! Accepts the `policy.json` shape used by container tooling, restricted to
//! the requirement types that need no signature verification:
//!
//! ```json
//! {
//!   "default": [{"type": "insecureAcceptAnything"}],
//!   "transports": {"docker": {"quay.io/evil": [{"type": "reject"}]}}
//! }
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::reference::ImageRef;
use crate::transport::ImageSource;

/// Transport name that registry scopes are listed under.
const DOCKER_TRANSPORT: &str = "docker";

/// A single rule; every rule applying to an image must accept it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyRequirement {
    InsecureAcceptAnything,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    pub default: Vec<PolicyRequirement>,
    /// Transport name, then scope (`registry` or `registry/repository`).
    #[serde(default)]
    pub transports: BTreeMap<String, BTreeMap<String, Vec<PolicyRequirement>>>,
}

impl Policy {
    /// The policy applied to every run: trust any source.
    pub fn accept_anything() -> Self {
        Self {
            default: vec![PolicyRequirement::InsecureAcceptAnything],
            transports: BTreeMap::new(),
        }
    }
}

/// A validated policy, built once per run and shared by every copy.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    policy: Policy,
}

impl PolicyContext {
    /// Validate `policy`.  Empty requirement lists are refused because they
    /// would silently accept everything.
    pub fn new(policy: Policy) -> Result<Self> {
        if policy.default.is_empty() {
            return Err(OciError::Policy(
                "default policy has no requirements".to_string(),
            ));
        }
        for (transport, scopes) in &policy.transports {
            for (scope, requirements) in scopes {
                if requirements.is_empty() {
                    return Err(OciError::Policy(format!(
                        "scope {}:{} has no requirements",
                        transport, scope
                    )));
                }
            }
        }
        Ok(Self { policy })
    }

    /// Decide whether `image` may be pulled from its registry.
    pub fn check(&self, image: &ImageRef) -> Result<()> {
        let requirements = self.requirements_for(image);
        evaluate(requirements, &image.to_string())
    }

    /// Decide whether `source` may be copied.  Sources without a registry
    /// reference (local layouts) fall under the default requirements.
    pub fn check_source(&self, source: &dyn ImageSource) -> Result<()> {
        match source.reference() {
            Some(image) => self.check(image),
            None => evaluate(&self.policy.default, &source.describe()),
        }
    }

    fn requirements_for(&self, image: &ImageRef) -> &[PolicyRequirement] {
        let Some(scopes) = self.policy.transports.get(DOCKER_TRANSPORT) else {
            return &self.policy.default;
        };
        let repository = format!("{}/{}", image.registry, image.repository);
        scopes
            .get(&repository)
            .or_else(|| scopes.get(&image.registry))
            .map(Vec::as_slice)
            .unwrap_or(&self.policy.default)
    }
}

fn evaluate(requirements: &[PolicyRequirement], subject: &str) -> Result<()> {
    for requirement in requirements {
        match requirement {
            PolicyRequirement::InsecureAcceptAnything => {}
            PolicyRequirement::Reject => {
                debug!(subject, "rejected by policy");
                return Err(OciError::PolicyRejected(subject.to_string()));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

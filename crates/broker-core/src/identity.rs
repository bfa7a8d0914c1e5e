//! Spec naming and validation.
//!
//! A spec's fully-qualified name is derived from the registry it was loaded
//! from and its image reference; its ID is a content hash of that name, so
//! reloading the same image from the same registry always yields the same ID.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::Spec;

/// Longest fully-qualified name kept after derivation.
pub const MAX_FQ_NAME_LEN: usize = 51;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("specs must have a name")]
    MissingName,
    #[error("specs must have a description")]
    MissingDescription,
    #[error("specs must have at least one plan")]
    NoPlans,
    #[error("plans within a spec must not contain duplicate value: {0}")]
    DuplicatePlan(String),
}

/// `{registry}-{image}` with `:` and `/` turned into `-`, capped at
/// [`MAX_FQ_NAME_LEN`] characters and without a trailing `-`.
pub fn derive_fq_name(registry: &str, image: &str) -> String {
    let joined = format!("{registry}-{}", image.replace(':', "-")).replace('/', "-");
    let truncated: String = joined.chars().take(MAX_FQ_NAME_LEN).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Hex SHA-256 of the input.
pub fn content_id(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

impl Spec {
    /// Set `fq_name` and `id` for this spec and an `id` on every plan.
    pub fn assign_identity(&mut self, registry: &str) {
        self.fq_name = derive_fq_name(registry, &self.image);
        self.id = content_id(&self.fq_name);
        for plan in &mut self.plans {
            plan.id = content_id(&format!("{}-{}", self.fq_name, plan.name));
        }
    }
}

/// Check the structural rules every catalog entry must satisfy.
pub fn validate_spec(spec: &Spec) -> Result<(), SpecError> {
    if spec.fq_name.is_empty() {
        return Err(SpecError::MissingName);
    }
    if spec.description.is_empty() {
        return Err(SpecError::MissingDescription);
    }
    if spec.plans.is_empty() {
        return Err(SpecError::NoPlans);
    }
    let mut seen = std::collections::HashSet::new();
    for plan in &spec.plans {
        if !seen.insert(plan.name.as_str()) {
            return Err(SpecError::DuplicatePlan(plan.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Plan;

    fn spec(image: &str) -> Spec {
        serde_json::from_value(serde_json::json!({
            "image": image,
            "description": "a service",
            "plans": [{"name": "default"}, {"name": "prod"}],
        }))
        .unwrap()
    }

    #[test]
    fn fq_name_replaces_separators() {
        assert_eq!(derive_fq_name("h", "org/hello-world-apb"), "h-org-hello-world-apb");
        assert_eq!(derive_fq_name("dh", "org/app:latest"), "dh-org-app-latest");
    }

    #[test]
    fn fq_name_strips_trailing_dash() {
        assert_eq!(
            derive_fq_name("h", "1234567890123456789012345678901234567890-"),
            "h-1234567890123456789012345678901234567890"
        );
    }

    #[test]
    fn fq_name_is_truncated() {
        let long = "a".repeat(80);
        let name = derive_fq_name("reg", &long);
        assert_eq!(name.len(), MAX_FQ_NAME_LEN);
        assert!(name.starts_with("reg-aaa"));
    }

    #[test]
    fn identity_is_stable() {
        let mut a = spec("org/hello-world-apb");
        let mut b = spec("org/hello-world-apb");
        a.assign_identity("h");
        b.assign_identity("h");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
        assert_eq!(a.fq_name, "h-org-hello-world-apb");

        let mut other = spec("org/hello-world-apb");
        other.assign_identity("q");
        assert_ne!(a.id, other.id);
    }

    #[test]
    fn plans_get_distinct_ids() {
        let mut s = spec("org/app");
        s.assign_identity("h");
        assert!(!s.plans[0].id.is_empty());
        assert_ne!(s.plans[0].id, s.plans[1].id);
    }

    #[test]
    fn validation_rules() {
        let mut s = spec("org/app");
        assert_eq!(validate_spec(&s), Err(SpecError::MissingName));

        s.assign_identity("h");
        assert!(validate_spec(&s).is_ok());

        s.description.clear();
        assert_eq!(validate_spec(&s), Err(SpecError::MissingDescription));

        s.description = "back".into();
        s.plans.push(Plan {
            name: "prod".into(),
            ..s.plans[0].clone()
        });
        assert_eq!(validate_spec(&s), Err(SpecError::DuplicatePlan("prod".into())));

        s.plans.clear();
        assert_eq!(validate_spec(&s), Err(SpecError::NoPlans));
    }
}

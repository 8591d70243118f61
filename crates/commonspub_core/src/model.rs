use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Error,
    Skipped,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Closed set of publishable operations. Adding a variant is a compile-time
/// checked change in the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Category(CategoryAction),
    Wikidata(WikidataAction),
    Image(ImageAction),
    StructuredData(StructuredDataAction),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryAction {
    pub category_name: String,
    pub parent_category: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub additional_parents: Vec<String>,
    /// Wikidata item the category page should link, when known.
    pub entity_id: Option<String>,
    #[serde(default)]
    pub exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WikidataOp {
    Create,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimChange {
    pub property: String,
    pub old_value: Option<String>,
    pub new_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WikidataAction {
    pub entity_id: String,
    pub entity_type: String,
    pub entity_label: String,
    pub op: WikidataOp,
    #[serde(default)]
    pub changes: Vec<ClaimChange>,
    pub description: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageOp {
    Upload,
    UpdateMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ImageMetadata {
    pub wikitext: String,
    pub comment: String,
    pub file_path: Option<String>,
    /// When set, a successful upload also attempts a best-effort P18 claim
    /// on this entity.
    pub main_image_entity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAction {
    pub image_id: String,
    pub filename: String,
    pub op: ImageOp,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredProperty {
    pub property: String,
    pub value: String,
    #[serde(default)]
    pub needs_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepictsRef {
    pub qid: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredDataAction {
    pub image_id: String,
    /// Set only after the corresponding upload completes.
    pub commons_page_id: Option<u64>,
    #[serde(default)]
    pub properties: Vec<StructuredProperty>,
    #[serde(default)]
    pub captions: BTreeMap<String, String>,
    #[serde(default)]
    pub depicts: Vec<DepictsRef>,
}

/// One queued action with its identity, lifecycle state and explicit
/// dependency reference. The dependency is resolved once at plan load time,
/// never re-derived from naming conventions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub id: ActionId,
    #[serde(flatten)]
    pub action: Action,
    #[serde(default = "default_status")]
    pub status: ActionStatus,
    pub error: Option<String>,
    pub depends_on: Option<ActionId>,
}

fn default_status() -> ActionStatus {
    ActionStatus::Pending
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorySource {
    P373,
    Disambiguated,
    Base,
}

/// Result of one category resolution for one performer. Recomputed per
/// publish cycle, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformerCategoryInfo {
    pub performer_name: String,
    pub performer_qid: String,
    pub commons_category: String,
    pub source: CategorySource,
    pub needs_creation: bool,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PublishPlan {
    pub actions: Vec<ActionRecord>,
}

impl PublishPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut plan: PublishPlan = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        plan.link_dependencies()?;
        plan.validate()?;
        Ok(plan)
    }

    /// Gives structured-data actions without an explicit dependency the
    /// upload action for the same image id.
    pub fn link_dependencies(&mut self) -> Result<()> {
        let mut upload_by_image: BTreeMap<String, ActionId> = BTreeMap::new();
        for record in &self.actions {
            if let Action::Image(image) = &record.action
                && image.op == ImageOp::Upload
            {
                if upload_by_image.contains_key(&image.image_id) {
                    bail!("duplicate upload action for image {}", image.image_id);
                }
                upload_by_image.insert(image.image_id.clone(), record.id.clone());
            }
        }
        for record in &mut self.actions {
            if let Action::StructuredData(sdc) = &record.action
                && record.depends_on.is_none()
            {
                record.depends_on = upload_by_image.get(&sdc.image_id).cloned();
            }
        }
        Ok(())
    }

    /// Enforces the shape invariants: unique ids, no dangling references,
    /// dependencies only on structured-data actions, and a dependency graph
    /// at most one level deep.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for record in &self.actions {
            if record.id.as_str().trim().is_empty() {
                bail!("action with empty id");
            }
            if !seen.insert(record.id.clone()) {
                bail!("duplicate action id: {}", record.id);
            }
        }

        let by_id: BTreeMap<&ActionId, &ActionRecord> = self
            .actions
            .iter()
            .map(|record| (&record.id, record))
            .collect();

        for record in &self.actions {
            let Some(dependency_id) = &record.depends_on else {
                continue;
            };
            let Action::StructuredData(sdc) = &record.action else {
                bail!(
                    "action {} declares a dependency but only structured-data actions may",
                    record.id
                );
            };
            let Some(dependency) = by_id.get(dependency_id) else {
                bail!(
                    "action {} depends on unknown action {}",
                    record.id,
                    dependency_id
                );
            };
            if dependency.id == record.id {
                bail!("action {} depends on itself", record.id);
            }
            if dependency.depends_on.is_some() {
                bail!(
                    "action {} depends on {} which itself has a dependency; \
                     chains deeper than one level are not allowed",
                    record.id,
                    dependency_id
                );
            }
            match &dependency.action {
                Action::Image(image) if image.op == ImageOp::Upload => {
                    if image.image_id != sdc.image_id {
                        bail!(
                            "action {} depends on upload for image {} but targets image {}",
                            record.id,
                            image.image_id,
                            sdc.image_id
                        );
                    }
                }
                _ => bail!(
                    "action {} must depend on an image upload, not {}",
                    record.id,
                    dependency_id
                ),
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &ActionId) -> Option<&ActionRecord> {
        self.actions.iter().find(|record| &record.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_record(id: &str, image_id: &str) -> ActionRecord {
        ActionRecord {
            id: ActionId::new(id),
            action: Action::Image(ImageAction {
                image_id: image_id.to_string(),
                filename: format!("{image_id}.jpg"),
                op: ImageOp::Upload,
                metadata: ImageMetadata {
                    wikitext: "== Summary ==".to_string(),
                    comment: "upload".to_string(),
                    file_path: Some("/tmp/img.jpg".to_string()),
                    main_image_entity: None,
                },
            }),
            status: ActionStatus::Pending,
            error: None,
            depends_on: None,
        }
    }

    fn sdc_record(id: &str, image_id: &str, depends_on: Option<&str>) -> ActionRecord {
        ActionRecord {
            id: ActionId::new(id),
            action: Action::StructuredData(StructuredDataAction {
                image_id: image_id.to_string(),
                commons_page_id: None,
                properties: Vec::new(),
                captions: BTreeMap::new(),
                depicts: Vec::new(),
            }),
            status: ActionStatus::Pending,
            error: None,
            depends_on: depends_on.map(ActionId::new),
        }
    }

    #[test]
    fn status_terminality() {
        assert!(ActionStatus::Completed.is_terminal());
        assert!(ActionStatus::Skipped.is_terminal());
        assert!(!ActionStatus::Error.is_terminal());
        assert!(!ActionStatus::Ready.is_terminal());
    }

    #[test]
    fn link_dependencies_wires_sdc_to_matching_upload() {
        let mut plan = PublishPlan {
            actions: vec![upload_record("img-1", "band01"), sdc_record("sdc-1", "band01", None)],
        };
        plan.link_dependencies().expect("link");
        plan.validate().expect("validate");
        assert_eq!(
            plan.actions[1].depends_on,
            Some(ActionId::new("img-1"))
        );
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let plan = PublishPlan {
            actions: vec![upload_record("a", "x"), upload_record("a", "y")],
        };
        let error = plan.validate().expect_err("must fail");
        assert!(error.to_string().contains("duplicate action id"));
    }

    #[test]
    fn validate_rejects_dangling_dependency() {
        let plan = PublishPlan {
            actions: vec![sdc_record("sdc-1", "band01", Some("missing"))],
        };
        let error = plan.validate().expect_err("must fail");
        assert!(error.to_string().contains("unknown action"));
    }

    #[test]
    fn validate_rejects_dependency_on_non_upload() {
        let plan = PublishPlan {
            actions: vec![
                sdc_record("sdc-1", "band01", Some("sdc-2")),
                sdc_record("sdc-2", "band01", None),
            ],
        };
        let error = plan.validate().expect_err("must fail");
        assert!(error.to_string().contains("must depend on an image upload"));
    }

    #[test]
    fn validate_rejects_mismatched_image_ids() {
        let plan = PublishPlan {
            actions: vec![
                upload_record("img-1", "band01"),
                sdc_record("sdc-1", "band02", Some("img-1")),
            ],
        };
        let error = plan.validate().expect_err("must fail");
        assert!(error.to_string().contains("targets image band02"));
    }

    #[test]
    fn plan_round_trips_through_json() {
        let plan = PublishPlan {
            actions: vec![upload_record("img-1", "band01"), sdc_record("sdc-1", "band01", Some("img-1"))],
        };
        let encoded = serde_json::to_string(&plan).expect("encode");
        let decoded: PublishPlan = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, plan);
    }

    #[test]
    fn action_json_uses_kebab_case_tags() {
        let record = upload_record("img-1", "band01");
        let value = serde_json::to_value(&record).expect("encode");
        assert_eq!(value.get("type"), Some(&serde_json::json!("image")));
        assert_eq!(value.get("status"), Some(&serde_json::json!("pending")));
        assert_eq!(value.get("op"), Some(&serde_json::json!("upload")));
    }
}

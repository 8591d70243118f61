//! Mock API implementations shared by the resolver, executor and scheduler
//! tests.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use serde_json::Value;

use crate::api::{
    CommonsApi, CreateCategoryOutcome, EntityInfo, UploadOutcome, UploadRequest, WikidataApi,
};

#[derive(Default)]
pub struct MockCommons {
    pub existing_categories: BTreeSet<String>,
    pub category_pages: BTreeMap<String, String>,
    pub created_categories: Vec<(String, String, String)>,
    pub create_reports_existed: bool,
    pub create_fails_with: Option<String>,
    pub exists_check_fails: bool,
    pub upload_page_id: Option<u64>,
    pub upload_fails_with: Option<String>,
    pub uploads: Vec<UploadRequest>,
    pub edited_pages: Vec<(String, String, String)>,
    pub media_info_edits: Vec<(u64, Value)>,
    pub media_info_fails_with: Option<String>,
    pub request_count: usize,
}

impl MockCommons {
    pub fn with_category(mut self, name: &str) -> Self {
        self.existing_categories.insert(fold(name));
        self
    }

    pub fn with_category_page(mut self, name: &str, wikitext: &str) -> Self {
        self.existing_categories.insert(fold(name));
        self.category_pages.insert(fold(name), wikitext.to_string());
        self
    }
}

impl CommonsApi for MockCommons {
    fn category_exists(&mut self, name: &str) -> Result<bool> {
        self.request_count += 1;
        if self.exists_check_fails {
            bail!("network unreachable");
        }
        Ok(self.existing_categories.contains(&fold(name)))
    }

    fn category_wikitext(&mut self, name: &str) -> Result<Option<String>> {
        self.request_count += 1;
        Ok(self.category_pages.get(&fold(name)).cloned())
    }

    fn create_category(
        &mut self,
        name: &str,
        wikitext: &str,
        summary: &str,
    ) -> Result<CreateCategoryOutcome> {
        self.request_count += 1;
        if let Some(message) = &self.create_fails_with {
            bail!("{message}");
        }
        self.created_categories
            .push((name.to_string(), wikitext.to_string(), summary.to_string()));
        self.existing_categories.insert(fold(name));
        Ok(CreateCategoryOutcome {
            success: true,
            existed: self.create_reports_existed,
        })
    }

    fn upload_file(&mut self, request: &UploadRequest) -> Result<UploadOutcome> {
        self.request_count += 1;
        if let Some(message) = &self.upload_fails_with {
            bail!("{message}");
        }
        self.uploads.push(request.clone());
        Ok(UploadOutcome {
            page_id: self.upload_page_id.unwrap_or(12_345),
        })
    }

    fn edit_file_page(&mut self, filename: &str, wikitext: &str, summary: &str) -> Result<()> {
        self.request_count += 1;
        self.edited_pages.push((
            filename.to_string(),
            wikitext.to_string(),
            summary.to_string(),
        ));
        Ok(())
    }

    fn edit_media_info(&mut self, page_id: u64, data: &Value) -> Result<()> {
        self.request_count += 1;
        if let Some(message) = &self.media_info_fails_with {
            bail!("{message}");
        }
        self.media_info_edits.push((page_id, data.clone()));
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Default)]
pub struct MockWikidata {
    pub entities: BTreeMap<String, EntityInfo>,
    pub entities_by_label: BTreeMap<String, String>,
    pub created_entities: Vec<Value>,
    pub created_claims: Vec<(String, String, Value)>,
    pub claim_fails_for: BTreeSet<String>,
    pub request_count: usize,
}

impl MockWikidata {
    pub fn with_entity(mut self, info: EntityInfo) -> Self {
        self.entities.insert(info.qid.clone(), info);
        self
    }

    pub fn with_label(mut self, label: &str, qid: &str) -> Self {
        self.entities_by_label.insert(fold(label), qid.to_string());
        self
    }
}

impl WikidataApi for MockWikidata {
    fn get_entity(&mut self, qid: &str) -> Result<Option<EntityInfo>> {
        self.request_count += 1;
        Ok(self.entities.get(qid).cloned())
    }

    fn find_entity_by_label(&mut self, label: &str, _language: &str) -> Result<Option<String>> {
        self.request_count += 1;
        Ok(self.entities_by_label.get(&fold(label)).cloned())
    }

    fn create_entity(&mut self, data: &Value) -> Result<String> {
        self.request_count += 1;
        self.created_entities.push(data.clone());
        Ok(format!("Q90{}", self.created_entities.len()))
    }

    fn create_claim(&mut self, entity_id: &str, property: &str, value: &Value) -> Result<()> {
        self.request_count += 1;
        if self.claim_fails_for.contains(property) {
            bail!("MediaWiki API error [failed-save]: claim rejected");
        }
        self.created_claims
            .push((entity_id.to_string(), property.to_string(), value.clone()));
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn entity(qid: &str, label: &str, claims: &[(&str, &[&str])]) -> EntityInfo {
    EntityInfo {
        qid: qid.to_string(),
        label: Some(label.to_string()),
        claims: claims
            .iter()
            .map(|(property, values)| {
                (
                    (*property).to_string(),
                    values.iter().map(|value| (*value).to_string()).collect(),
                )
            })
            .collect(),
    }
}

fn fold(value: &str) -> String {
    value.trim().to_lowercase()
}

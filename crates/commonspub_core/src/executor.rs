use anyhow::anyhow;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::api::{CommonsApi, UploadRequest, WikidataApi};
use crate::cache::LookupCache;
use crate::config::UnlinkedCategoryPolicy;
use crate::error::{ActionError, ActionResult};
use crate::model::{
    Action, ActionRecord, CategoryAction, ImageAction, ImageOp, StructuredDataAction,
    WikidataAction, WikidataOp,
};
use crate::resolver::{
    CATEGORY_EXISTS_KIND, ClaimValue, ENTITY_BY_NAME_KIND, ENTITY_KIND, P_MAIN_IMAGE, Resolver,
    resolve_claim_value,
};

/// Properties whose values reference other entities that must already exist.
const ENTITY_REFERENCE_PROPERTIES: &[&str] = &["P710", "P527"];

const DEPICTS_PROPERTY: &str = "P180";

/// Everything one action execution may touch. Borrowed for the duration of a
/// single dispatch; the scheduler re-borrows per action.
pub struct ExecutionContext<'a, C: CommonsApi, W: WikidataApi> {
    pub commons: &'a mut C,
    pub wikidata: &'a mut W,
    pub cache: &'a mut LookupCache,
    pub unlinked_policy: UnlinkedCategoryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOutcome {
    /// Commons page id of a completed upload; used by the scheduler to
    /// unlock the structured-data action for the same image.
    pub uploaded_page_id: Option<u64>,
    pub detail: Option<String>,
}

/// Dispatch an action to its sub-executor. Exhaustive over the action enum,
/// so a new action kind fails to compile until it is handled here.
pub fn execute<C: CommonsApi, W: WikidataApi>(
    record: &ActionRecord,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    match &record.action {
        Action::Category(action) => execute_category(action, ctx),
        Action::Wikidata(action) => execute_wikidata(action, ctx),
        Action::Image(action) => execute_image(action, ctx),
        Action::StructuredData(action) => execute_structured_data(action, ctx),
    }
}

fn execute_category<C: CommonsApi, W: WikidataApi>(
    action: &CategoryAction,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    let name = action.category_name.trim();
    if name.is_empty() {
        return Err(ActionError::precondition("category action has no name"));
    }

    let wikitext = category_wikitext(action);
    let outcome = ctx
        .commons
        .create_category(name, &wikitext, "Creating performer category")
        .map_err(classify_remote_error)?;

    // The wiki state changed (or disagreed with what we cached); either way
    // the existence entry is stale now.
    ctx.cache.invalidate(CATEGORY_EXISTS_KIND, name);

    let detail = if outcome.existed {
        Some(format!("category {name} already existed"))
    } else {
        Some(format!("created category {name}"))
    };
    Ok(ExecuteOutcome {
        uploaded_page_id: None,
        detail,
    })
}

pub fn category_wikitext(action: &CategoryAction) -> String {
    let mut lines = Vec::new();
    if let Some(description) = &action.description {
        lines.push(description.clone());
    }
    if let Some(entity_id) = &action.entity_id {
        lines.push(format!("{{{{Wikidata Infobox|qid={entity_id}}}}}"));
    }
    if let Some(parent) = &action.parent_category {
        lines.push(format!("[[Category:{parent}]]"));
    }
    for parent in &action.additional_parents {
        lines.push(format!("[[Category:{parent}]]"));
    }
    lines.join("\n")
}

fn execute_wikidata<C: CommonsApi, W: WikidataApi>(
    action: &WikidataAction,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    match action.op {
        WikidataOp::Create => create_entity(action, ctx),
        WikidataOp::Update => update_entity_claims(action, ctx),
    }
}

fn create_entity<C: CommonsApi, W: WikidataApi>(
    action: &WikidataAction,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    if action.entity_label.trim().is_empty() {
        return Err(ActionError::precondition("entity creation needs a label"));
    }
    let language = action.language.as_deref().unwrap_or("en");

    let mut payload = Map::new();
    payload.insert(
        "labels".to_string(),
        json!({language: {"language": language, "value": action.entity_label}}),
    );
    if let Some(description) = &action.description {
        payload.insert(
            "descriptions".to_string(),
            json!({language: {"language": language, "value": description}}),
        );
    }
    let mut claims = Vec::new();
    for change in &action.changes {
        let value = resolve_claim_value(&change.property, &change.new_value);
        claims.push(claim_statement(&change.property, &value));
    }
    if !claims.is_empty() {
        payload.insert("claims".to_string(), Value::Array(claims));
    }

    let new_qid = ctx
        .wikidata
        .create_entity(&Value::Object(payload))
        .map_err(classify_remote_error)?;
    ctx.cache.set(
        ENTITY_BY_NAME_KIND,
        &action.entity_label,
        Value::String(new_qid.clone()),
    );
    Ok(ExecuteOutcome {
        uploaded_page_id: None,
        detail: Some(format!("created entity {new_qid}")),
    })
}

fn update_entity_claims<C: CommonsApi, W: WikidataApi>(
    action: &WikidataAction,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    if action.changes.is_empty() {
        return Err(ActionError::precondition("entity update has no changes"));
    }

    let mut submitted = 0usize;
    let mut failures: Vec<String> = Vec::new();
    for change in &action.changes {
        let raw = if ENTITY_REFERENCE_PROPERTIES.contains(&change.property.as_str()) {
            let mut resolver = Resolver::new(
                ctx.commons,
                ctx.wikidata,
                ctx.cache,
                ctx.unlinked_policy,
            );
            match resolver.resolve_entity_reference(&change.property, &change.new_value) {
                Ok(qid) => qid,
                Err(error) => {
                    failures.push(format!("{}: {error}", change.property));
                    continue;
                }
            }
        } else {
            change.new_value.clone()
        };

        let value = resolve_claim_value(&change.property, &raw);
        match ctx
            .wikidata
            .create_claim(&action.entity_id, &change.property, &value.to_wire())
        {
            Ok(()) => submitted += 1,
            Err(error) => failures.push(format!("{}: {error}", change.property)),
        }
    }

    if submitted > 0 {
        // Claims changed on the wire; cached entity data is stale.
        ctx.cache.invalidate(ENTITY_KIND, &action.entity_id);
    }
    if !failures.is_empty() {
        return Err(ActionError::Other(anyhow!(
            "{} of {} claims failed: {}",
            failures.len(),
            action.changes.len(),
            failures.join("; ")
        )));
    }
    Ok(ExecuteOutcome {
        uploaded_page_id: None,
        detail: Some(format!("submitted {submitted} claims")),
    })
}

fn execute_image<C: CommonsApi, W: WikidataApi>(
    action: &ImageAction,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    if action.metadata.wikitext.trim().is_empty() {
        return Err(ActionError::precondition("image action has no wikitext"));
    }
    match action.op {
        ImageOp::Upload => {
            let Some(file_path) = &action.metadata.file_path else {
                return Err(ActionError::precondition("upload action has no file"));
            };
            let request = UploadRequest {
                filename: action.filename.clone(),
                file_path: file_path.into(),
                wikitext: action.metadata.wikitext.clone(),
                comment: action.metadata.comment.clone(),
            };
            let outcome = ctx
                .commons
                .upload_file(&request)
                .map_err(classify_remote_error)?;
            debug!(filename = %action.filename, page_id = outcome.page_id, "upload complete");

            if let Some(entity_id) = &action.metadata.main_image_entity {
                attach_main_image_claim(entity_id, &action.filename, ctx);
            }

            Ok(ExecuteOutcome {
                uploaded_page_id: Some(outcome.page_id),
                detail: Some(format!("uploaded as page {}", outcome.page_id)),
            })
        }
        ImageOp::UpdateMetadata => {
            ctx.commons
                .edit_file_page(
                    &action.filename,
                    &action.metadata.wikitext,
                    &action.metadata.comment,
                )
                .map_err(classify_remote_error)?;
            Ok(ExecuteOutcome {
                uploaded_page_id: None,
                detail: Some("file page updated".to_string()),
            })
        }
    }
}

/// Best-effort P18 claim after an upload. Its failure never fails the upload
/// that triggered it.
fn attach_main_image_claim<C: CommonsApi, W: WikidataApi>(
    entity_id: &str,
    filename: &str,
    ctx: &mut ExecutionContext<'_, C, W>,
) {
    let value = Value::String(filename.to_string());
    match ctx.wikidata.create_claim(entity_id, P_MAIN_IMAGE, &value) {
        Ok(()) => {
            ctx.cache.invalidate(ENTITY_KIND, entity_id);
        }
        Err(error) => {
            warn!(entity = %entity_id, error = %error, "main-image claim failed; upload stands");
        }
    }
}

fn execute_structured_data<C: CommonsApi, W: WikidataApi>(
    action: &StructuredDataAction,
    ctx: &mut ExecutionContext<'_, C, W>,
) -> ActionResult<ExecuteOutcome> {
    let page_id = match action.commons_page_id {
        Some(page_id) if page_id > 0 => page_id,
        _ => {
            return Err(ActionError::precondition(
                "structured-data action has no Commons page id",
            ));
        }
    };

    let mut data = Map::new();
    if !action.captions.is_empty() {
        let mut labels = Map::new();
        for (language, text) in &action.captions {
            labels.insert(
                language.clone(),
                json!({"language": language, "value": text}),
            );
        }
        data.insert("labels".to_string(), Value::Object(labels));
    }

    let mut claims = Map::new();
    if !action.depicts.is_empty() {
        let statements: Vec<Value> = action
            .depicts
            .iter()
            .map(|depicts| {
                claim_statement(
                    DEPICTS_PROPERTY,
                    &ClaimValue::Entity(depicts.qid.clone()),
                )
            })
            .collect();
        claims.insert(DEPICTS_PROPERTY.to_string(), Value::Array(statements));
    }
    for property in &action.properties {
        if !property.needs_update {
            continue;
        }
        let value = resolve_claim_value(&property.property, &property.value);
        let statement = claim_statement(&property.property, &value);
        if let Value::Array(statements) = claims
            .entry(property.property.clone())
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            statements.push(statement);
        }
    }
    if !claims.is_empty() {
        data.insert("claims".to_string(), Value::Object(claims));
    }

    if data.is_empty() {
        return Ok(ExecuteOutcome {
            uploaded_page_id: None,
            detail: Some("nothing to update".to_string()),
        });
    }

    ctx.commons
        .edit_media_info(page_id, &Value::Object(data))
        .map_err(classify_remote_error)?;
    Ok(ExecuteOutcome {
        uploaded_page_id: None,
        detail: Some(format!("structured data updated on M{page_id}")),
    })
}

fn claim_statement(property: &str, value: &ClaimValue) -> Value {
    let value_type = match value {
        ClaimValue::Time(_) => "time",
        ClaimValue::Entity(_) => "wikibase-entityid",
        ClaimValue::Text(_) => "string",
    };
    json!({
        "mainsnak": {
            "snaktype": "value",
            "property": property,
            "datavalue": {"value": value.to_wire(), "type": value_type}
        },
        "type": "statement",
        "rank": "normal"
    })
}

/// Map a client failure onto the action error taxonomy. API-level rejections
/// keep their code and info; everything else stays an opaque failure.
fn classify_remote_error(error: anyhow::Error) -> ActionError {
    let message = error.to_string();
    if let Some(rest) = message.strip_prefix("MediaWiki API error [")
        && let Some((code, info)) = rest.split_once("]: ")
    {
        return ActionError::RemoteRejection {
            code: code.to_string(),
            info: info.to_string(),
        };
    }
    ActionError::Other(error)
}

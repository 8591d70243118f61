use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::api::{CommonsApi, EntityInfo, WikidataApi};
use crate::cache::LookupCache;
use crate::config::UnlinkedCategoryPolicy;
use crate::error::{ActionError, ActionResult};
use crate::model::{CategorySource, PerformerCategoryInfo};

pub const CATEGORY_EXISTS_KIND: &str = "commons-category-exists";
pub const ENTITY_KIND: &str = "wikidata-entity";
pub const ENTITY_BY_NAME_KIND: &str = "wikidata-entity-by-name";

pub const P_COMMONS_CATEGORY: &str = "P373";
pub const P_OCCUPATION: &str = "P106";
pub const P_NATIONALITY: &str = "P27";
pub const P_MAIN_IMAGE: &str = "P18";

/// Properties whose string values are calendar dates on the wire.
const TIME_PROPERTIES: &[&str] = &["P569", "P570", "P571", "P577", "P580", "P582"];

const GREGORIAN_CALENDAR: &str = "http://www.wikidata.org/entity/Q1985727";

/// Occupation item → category qualifier.
const OCCUPATION_LABELS: &[(&str, &str)] = &[
    ("Q177220", "singer"),
    ("Q855091", "guitarist"),
    ("Q386854", "drummer"),
    ("Q486748", "pianist"),
    ("Q36834", "composer"),
    ("Q130857", "DJ"),
    ("Q183945", "record producer"),
    ("Q639669", "musician"),
];

/// Country item → demonym, for the `(<demonym> musician)` fallback.
const NATIONALITY_DEMONYMS: &[(&str, &str)] = &[
    ("Q20", "Norwegian"),
    ("Q34", "Swedish"),
    ("Q35", "Danish"),
    ("Q33", "Finnish"),
    ("Q189", "Icelandic"),
    ("Q30", "American"),
    ("Q145", "British"),
    ("Q183", "German"),
    ("Q142", "French"),
    ("Q29", "Spanish"),
    ("Q38", "Italian"),
];

/// Resolves Commons category names and Wikidata claim values against live
/// wiki state, cache-first. Holds mutable borrows for the duration of one
/// resolution pass; the publish cycle constructs one resolver per pass.
pub struct Resolver<'a, C: CommonsApi, W: WikidataApi> {
    commons: &'a mut C,
    wikidata: &'a mut W,
    cache: &'a mut LookupCache,
    unlinked_policy: UnlinkedCategoryPolicy,
}

impl<'a, C: CommonsApi, W: WikidataApi> Resolver<'a, C, W> {
    pub fn new(
        commons: &'a mut C,
        wikidata: &'a mut W,
        cache: &'a mut LookupCache,
        unlinked_policy: UnlinkedCategoryPolicy,
    ) -> Self {
        Self {
            commons,
            wikidata,
            cache,
            unlinked_policy,
        }
    }

    /// Determine the Commons category to use for a performer entity.
    ///
    /// Ordered, first match wins: explicit P373 claim, free base name,
    /// base name already linked to this entity, then a disambiguated name
    /// qualified by occupation or nationality.
    pub fn resolve_performer_category(
        &mut self,
        qid: &str,
        display_name: &str,
    ) -> Result<PerformerCategoryInfo> {
        let entity = self.entity(qid)?.unwrap_or_else(|| EntityInfo {
            qid: qid.to_string(),
            ..EntityInfo::default()
        });
        let description = format!("Category for {display_name}.");

        if let Some(claimed) = entity.first_claim(P_COMMONS_CATEGORY) {
            let claimed = claimed.to_string();
            let needs_creation = !self.category_exists_conservative(&claimed);
            return Ok(PerformerCategoryInfo {
                performer_name: display_name.to_string(),
                performer_qid: qid.to_string(),
                commons_category: claimed,
                source: CategorySource::P373,
                needs_creation,
                description,
            });
        }

        let base = display_name.trim().to_string();
        if !self.category_exists_conservative(&base) {
            return Ok(PerformerCategoryInfo {
                performer_name: display_name.to_string(),
                performer_qid: qid.to_string(),
                commons_category: base,
                source: CategorySource::Base,
                needs_creation: true,
                description,
            });
        }

        let linked = self
            .commons
            .category_wikitext(&base)?
            .as_deref()
            .and_then(extract_linked_entity);
        match linked {
            Some(linked_qid) if linked_qid == qid => {
                return Ok(PerformerCategoryInfo {
                    performer_name: display_name.to_string(),
                    performer_qid: qid.to_string(),
                    commons_category: base,
                    source: CategorySource::Base,
                    needs_creation: false,
                    description,
                });
            }
            None if self.unlinked_policy == UnlinkedCategoryPolicy::Reuse => {
                debug!(category = %base, "reusing unlinked category per policy");
                return Ok(PerformerCategoryInfo {
                    performer_name: display_name.to_string(),
                    performer_qid: qid.to_string(),
                    commons_category: base,
                    source: CategorySource::Base,
                    needs_creation: false,
                    description,
                });
            }
            _ => {}
        }

        let qualified = format!("{} ({})", base, disambiguation_suffix(&entity));
        let needs_creation = !self.category_exists_conservative(&qualified);
        Ok(PerformerCategoryInfo {
            performer_name: display_name.to_string(),
            performer_qid: qid.to_string(),
            commons_category: qualified,
            source: CategorySource::Disambiguated,
            needs_creation,
            description,
        })
    }

    /// Cache-first existence check. A failed live check is treated as
    /// "exists", steering resolution away from creating anything; the
    /// conservative answer is not cached.
    fn category_exists_conservative(&mut self, name: &str) -> bool {
        if let Some(cached) = self.cache.get(CATEGORY_EXISTS_KIND, name)
            && let Some(exists) = cached.as_bool()
        {
            return exists;
        }
        match self.commons.category_exists(name) {
            Ok(exists) => {
                self.cache.set(CATEGORY_EXISTS_KIND, name, Value::Bool(exists));
                exists
            }
            Err(error) => {
                warn!(category = %name, error = %error, "existence check failed; assuming the name is taken");
                true
            }
        }
    }

    fn entity(&mut self, qid: &str) -> Result<Option<EntityInfo>> {
        if let Some(cached) = self.cache.get(ENTITY_KIND, qid)
            && let Ok(info) = serde_json::from_value::<EntityInfo>(cached)
        {
            return Ok(Some(info));
        }
        let fetched = self.wikidata.get_entity(qid)?;
        if let Some(info) = &fetched
            && let Ok(encoded) = serde_json::to_value(info)
        {
            self.cache.set(ENTITY_KIND, qid, encoded);
        }
        Ok(fetched)
    }

    /// Resolve a claim value that must name another entity (P710
    /// participant, P527 has-part). A value that is not already a Q-ID is
    /// looked up by label; failure to resolve is fatal for that claim only.
    pub fn resolve_entity_reference(
        &mut self,
        property: &str,
        value: &str,
    ) -> ActionResult<String> {
        if looks_like_qid(value) {
            return Ok(value.to_string());
        }
        if let Some(cached) = self.cache.get(ENTITY_BY_NAME_KIND, value)
            && let Some(qid) = cached.as_str()
        {
            return Ok(qid.to_string());
        }
        let found = self
            .wikidata
            .find_entity_by_label(value, "en")
            .map_err(ActionError::Other)?;
        match found {
            Some(qid) => {
                self.cache
                    .set(ENTITY_BY_NAME_KIND, value, Value::String(qid.clone()));
                Ok(qid)
            }
            None => Err(ActionError::UnresolvedReference {
                property: property.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// A claim value in the shape Wikidata's wire format expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimValue {
    Time(String),
    Entity(String),
    Text(String),
}

impl ClaimValue {
    /// JSON datavalue payload for `wbcreateclaim`.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Time(date) => json!({
                "time": format!("+{date}T00:00:00Z"),
                "timezone": 0,
                "before": 0,
                "after": 0,
                "precision": 11,
                "calendarmodel": GREGORIAN_CALENDAR,
            }),
            Self::Entity(qid) => {
                let numeric: u64 = qid[1..].parse().unwrap_or(0);
                json!({"entity-type": "item", "numeric-id": numeric})
            }
            Self::Text(text) => Value::String(text.clone()),
        }
    }
}

/// Classify a raw claim value: ISO dates on time-valued properties become
/// day-precision Gregorian time values, Q-IDs become entity references,
/// everything else is a plain string.
pub fn resolve_claim_value(property: &str, raw: &str) -> ClaimValue {
    let trimmed = raw.trim();
    if TIME_PROPERTIES.contains(&property) && is_iso_date(trimmed) {
        return ClaimValue::Time(trimmed.to_string());
    }
    if looks_like_qid(trimmed) {
        return ClaimValue::Entity(trimmed.to_string());
    }
    ClaimValue::Text(trimmed.to_string())
}

pub fn disambiguation_suffix(entity: &EntityInfo) -> String {
    if let Some(occupations) = entity.claims.get(P_OCCUPATION) {
        for occupation in occupations {
            if let Some(label) = lookup(OCCUPATION_LABELS, occupation) {
                return label.to_string();
            }
        }
    }
    if let Some(nationality) = entity.first_claim(P_NATIONALITY)
        && let Some(demonym) = lookup(NATIONALITY_DEMONYMS, nationality)
    {
        return format!("{demonym} musician");
    }
    "musician".to_string()
}

/// Find the entity a Commons category page links to, if any. Recognizes the
/// Wikidata Infobox qid parameter and direct entity-page links.
pub fn extract_linked_entity(wikitext: &str) -> Option<String> {
    for marker in ["qid=", "Special:EntityPage/", "[[wikidata:", "{{On Wikidata|"] {
        if let Some(start) = wikitext.find(marker) {
            let rest = &wikitext[start + marker.len()..];
            if let Some(qid) = leading_qid(rest) {
                return Some(qid);
            }
        }
    }
    None
}

fn leading_qid(text: &str) -> Option<String> {
    let text = text.trim_start();
    if !text.starts_with('Q') {
        return None;
    }
    let digits: String = text[1..].chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("Q{digits}"))
}

pub fn looks_like_qid(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next() == Some('Q') && {
        let rest = &value[1..];
        !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit())
    }
}

fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    value
        .char_indices()
        .all(|(index, ch)| matches!(index, 4 | 7) || ch.is_ascii_digit())
}

fn lookup<'t>(table: &[(&str, &'t str)], key: &str) -> Option<&'t str> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map(|(_, value)| *value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::LookupCache;
    use crate::testing::{MockCommons, MockWikidata, entity};

    fn resolve(
        commons: &mut MockCommons,
        wikidata: &mut MockWikidata,
        cache: &mut LookupCache,
        policy: UnlinkedCategoryPolicy,
        qid: &str,
        name: &str,
    ) -> PerformerCategoryInfo {
        Resolver::new(commons, wikidata, cache, policy)
            .resolve_performer_category(qid, name)
            .expect("resolve")
    }

    #[test]
    fn explicit_claim_wins_regardless_of_existence() {
        let mut commons = MockCommons::default();
        let mut wikidata = MockWikidata::default()
            .with_entity(entity("Q42", "Foo Band", &[(P_COMMONS_CATEGORY, &["Foo"])]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q42",
            "Foo Band",
        );
        assert_eq!(info.commons_category, "Foo");
        assert_eq!(info.source, CategorySource::P373);
        assert!(info.needs_creation);
    }

    #[test]
    fn free_base_name_is_used_and_flagged_for_creation() {
        let mut commons = MockCommons::default();
        let mut wikidata = MockWikidata::default().with_entity(entity("Q7", "Bar", &[]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Bar",
        );
        assert_eq!(info.commons_category, "Bar");
        assert_eq!(info.source, CategorySource::Base);
        assert!(info.needs_creation);
    }

    #[test]
    fn base_name_linked_to_same_entity_is_reused() {
        let mut commons = MockCommons::default()
            .with_category_page("Bar", "{{Wikidata Infobox|qid=Q7}}\n[[Category:Musicians]]");
        let mut wikidata = MockWikidata::default().with_entity(entity("Q7", "Bar", &[]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Bar",
        );
        assert_eq!(info.commons_category, "Bar");
        assert!(!info.needs_creation);
    }

    #[test]
    fn colliding_category_is_disambiguated_by_occupation() {
        let mut commons = MockCommons::default()
            .with_category_page("Nova", "{{Wikidata Infobox|qid=Q999}}");
        let mut wikidata = MockWikidata::default()
            .with_entity(entity("Q7", "Nova", &[(P_OCCUPATION, &["Q177220"])]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Nova",
        );
        assert_eq!(info.commons_category, "Nova (singer)");
        assert_eq!(info.source, CategorySource::Disambiguated);
        assert!(info.needs_creation);
    }

    #[test]
    fn unlinked_category_default_policy_disambiguates() {
        let mut commons =
            MockCommons::default().with_category_page("Nova", "Some plain category text");
        let mut wikidata = MockWikidata::default()
            .with_entity(entity("Q7", "Nova", &[(P_NATIONALITY, &["Q20"])]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Nova",
        );
        assert_eq!(info.commons_category, "Nova (Norwegian musician)");
        assert_eq!(info.source, CategorySource::Disambiguated);
    }

    #[test]
    fn unlinked_category_reuse_policy_takes_the_name() {
        let mut commons =
            MockCommons::default().with_category_page("Nova", "Some plain category text");
        let mut wikidata = MockWikidata::default().with_entity(entity("Q7", "Nova", &[]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Reuse,
            "Q7",
            "Nova",
        );
        assert_eq!(info.commons_category, "Nova");
        assert!(!info.needs_creation);
    }

    #[test]
    fn failed_existence_check_takes_the_conservative_branch() {
        let mut commons = MockCommons {
            exists_check_fails: true,
            ..MockCommons::default()
        };
        let mut wikidata = MockWikidata::default().with_entity(entity("Q7", "Nova", &[]));
        let mut cache = LookupCache::with_default_ttl();

        let info = resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Nova",
        );
        // Base name treated as taken; no page content either, so the
        // disambiguated name is chosen, itself conservatively "existing".
        assert_eq!(info.source, CategorySource::Disambiguated);
        assert!(!info.needs_creation);
    }

    #[test]
    fn existence_checks_are_cached_and_conservative_answers_are_not() {
        let mut commons = MockCommons::default().with_category("Bar");
        let mut wikidata = MockWikidata::default().with_entity(entity("Q7", "Bar", &[]));
        let mut cache = LookupCache::with_default_ttl();

        resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Reuse,
            "Q7",
            "Bar",
        );
        assert_eq!(
            cache.get(CATEGORY_EXISTS_KIND, "Bar"),
            Some(json!(true))
        );
    }

    #[test]
    fn entity_lookup_hits_cache_on_second_resolution() {
        let mut commons = MockCommons::default();
        let mut wikidata = MockWikidata::default().with_entity(entity("Q7", "Bar", &[]));
        let mut cache = LookupCache::with_default_ttl();

        resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Bar",
        );
        let after_first = wikidata.request_count;
        resolve(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
            "Q7",
            "Bar",
        );
        assert_eq!(wikidata.request_count, after_first);
    }

    #[test]
    fn suffix_falls_back_from_occupation_to_nationality_to_musician() {
        let with_occupation = entity("Q1", "A", &[(P_OCCUPATION, &["Q177220"])]);
        assert_eq!(disambiguation_suffix(&with_occupation), "singer");

        let with_nationality = entity("Q2", "B", &[(P_NATIONALITY, &["Q20"])]);
        assert_eq!(disambiguation_suffix(&with_nationality), "Norwegian musician");

        let unknown_occupation = entity(
            "Q3",
            "C",
            &[(P_OCCUPATION, &["Q999999"]), (P_NATIONALITY, &["Q34"])],
        );
        assert_eq!(disambiguation_suffix(&unknown_occupation), "Swedish musician");

        let bare = entity("Q4", "D", &[]);
        assert_eq!(disambiguation_suffix(&bare), "musician");
    }

    #[test]
    fn claim_values_classify_dates_entities_and_strings() {
        assert_eq!(
            resolve_claim_value("P569", "1952-03-11"),
            ClaimValue::Time("1952-03-11".to_string())
        );
        assert_eq!(
            resolve_claim_value("P577", " 2025-01-15 "),
            ClaimValue::Time("2025-01-15".to_string())
        );
        // Date-shaped strings on non-time properties stay strings.
        assert_eq!(
            resolve_claim_value("P373", "2025-01-15"),
            ClaimValue::Text("2025-01-15".to_string())
        );
        assert_eq!(
            resolve_claim_value("P710", "Q42"),
            ClaimValue::Entity("Q42".to_string())
        );
        assert_eq!(
            resolve_claim_value("P373", "Players of Arsenal"),
            ClaimValue::Text("Players of Arsenal".to_string())
        );
    }

    #[test]
    fn time_wire_format_has_day_precision_and_gregorian_calendar() {
        let wire = ClaimValue::Time("2025-01-15".to_string()).to_wire();
        assert_eq!(wire.get("time"), Some(&json!("+2025-01-15T00:00:00Z")));
        assert_eq!(wire.get("precision"), Some(&json!(11)));
        assert_eq!(wire.get("timezone"), Some(&json!(0)));
        assert_eq!(
            wire.get("calendarmodel"),
            Some(&json!("http://www.wikidata.org/entity/Q1985727"))
        );
    }

    #[test]
    fn entity_wire_format_uses_numeric_id() {
        let wire = ClaimValue::Entity("Q1985727".to_string()).to_wire();
        assert_eq!(wire.get("numeric-id"), Some(&json!(1_985_727)));
        assert_eq!(wire.get("entity-type"), Some(&json!("item")));
    }

    #[test]
    fn entity_reference_resolution_passes_qids_through() {
        let mut commons = MockCommons::default();
        let mut wikidata = MockWikidata::default();
        let mut cache = LookupCache::with_default_ttl();
        let mut resolver = Resolver::new(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
        );
        assert_eq!(
            resolver.resolve_entity_reference("P710", "Q42").expect("qid"),
            "Q42"
        );
    }

    #[test]
    fn entity_reference_resolution_looks_up_labels_and_caches() {
        let mut commons = MockCommons::default();
        let mut wikidata = MockWikidata::default().with_label("Jane Doe", "Q777");
        let mut cache = LookupCache::with_default_ttl();
        {
            let mut resolver = Resolver::new(
                &mut commons,
                &mut wikidata,
                &mut cache,
                UnlinkedCategoryPolicy::Disambiguate,
            );
            assert_eq!(
                resolver
                    .resolve_entity_reference("P710", "Jane Doe")
                    .expect("label"),
                "Q777"
            );
        }
        assert_eq!(
            cache.get(ENTITY_BY_NAME_KIND, "Jane Doe"),
            Some(json!("Q777"))
        );
    }

    #[test]
    fn unresolvable_reference_is_a_fatal_claim_error() {
        let mut commons = MockCommons::default();
        let mut wikidata = MockWikidata::default();
        let mut cache = LookupCache::with_default_ttl();
        let mut resolver = Resolver::new(
            &mut commons,
            &mut wikidata,
            &mut cache,
            UnlinkedCategoryPolicy::Disambiguate,
        );
        let error = resolver
            .resolve_entity_reference("P527", "Unknown Person")
            .expect_err("must fail");
        assert!(error.is_fatal());
    }

    #[test]
    fn linked_entity_extraction_recognizes_common_patterns() {
        assert_eq!(
            extract_linked_entity("{{Wikidata Infobox|qid=Q7}}"),
            Some("Q7".to_string())
        );
        assert_eq!(
            extract_linked_entity("See [[d:Special:EntityPage/Q42|item]]"),
            Some("Q42".to_string())
        );
        assert_eq!(
            extract_linked_entity("{{On Wikidata|Q123}}"),
            Some("Q123".to_string())
        );
        assert_eq!(extract_linked_entity("{{Wikidata Infobox}}"), None);
        assert_eq!(extract_linked_entity("plain text"), None);
    }
}

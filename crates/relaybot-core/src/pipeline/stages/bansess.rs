//! Session access control.
//!
//! Reads `trigger.access-control` from the pipeline config. Specs have
//! the shape `"<person|group>_<id>"` with `*` as the id wildcard:
//! `group_*` matches every group session, `person_42` exactly one.

use async_trait::async_trait;
use serde::Deserialize;

use relaybot_types::error::Result;

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AccessMode {
    Whitelist,
    #[default]
    Blacklist,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AccessControl {
    #[serde(default)]
    mode: AccessMode,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
}

/// The ban-session check stage.
pub struct BanSessionCheckStage {
    access_control: AccessControl,
}

impl BanSessionCheckStage {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        let access_control = pipeline_config
            .pointer("/trigger/access-control")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok(Self { access_control })
    }

    /// Whether `spec` matches the query's session.
    fn matches(spec: &str, query: &Query) -> bool {
        let Some((spec_type, spec_id)) = spec.split_once('_') else {
            return false;
        };
        spec_type == query.launcher_type.as_str()
            && (spec_id == "*" || spec_id == query.launcher_id)
    }
}

#[async_trait]
impl PipelineStage for BanSessionCheckStage {
    async fn process(
        &self,
        _ctx: &CoreContext,
        query: &mut Query,
        _inst_name: &str,
    ) -> Result<StageProcessResult> {
        let allowed = match self.access_control.mode {
            AccessMode::Whitelist => self
                .access_control
                .whitelist
                .iter()
                .any(|spec| Self::matches(spec, query)),
            AccessMode::Blacklist => !self
                .access_control
                .blacklist
                .iter()
                .any(|spec| Self::matches(spec, query)),
        };

        if allowed {
            Ok(StageProcessResult::cont())
        } else {
            // Access denial is silent: no user notice.
            Ok(StageProcessResult::interrupt()
                .with_console_notice(format!("session {} denied", query.session_key())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::entities::ResultType;
    use crate::pipeline::stages::testing::{person_query, test_context};
    use relaybot_types::event::LauncherType;

    fn config(mode: &str, list: &[&str]) -> serde_json::Value {
        let key = if mode == "whitelist" { "whitelist" } else { "blacklist" };
        serde_json::json!({
            "trigger": {"access-control": {"mode": mode, key: list}}
        })
    }

    async fn run(config: serde_json::Value, query: &mut Query) -> ResultType {
        let ctx = test_context();
        let stage = BanSessionCheckStage::new(&config).unwrap();
        stage
            .process(&ctx, query, "BanSessionCheckStage")
            .await
            .unwrap()
            .result_type
    }

    #[tokio::test]
    async fn whitelist_allows_listed_session() {
        let mut query = person_query("42", "hello");
        let result = run(config("whitelist", &["person_42"]), &mut query).await;
        assert_eq!(result, ResultType::Continue);
    }

    #[tokio::test]
    async fn whitelist_denies_unlisted_session() {
        let mut query = person_query("42", "hello");
        let result = run(config("whitelist", &["person_99999"]), &mut query).await;
        assert_eq!(result, ResultType::Interrupt);
    }

    #[tokio::test]
    async fn blacklist_allows_unlisted_session() {
        let mut query = person_query("42", "hello");
        let result = run(config("blacklist", &["person_99999"]), &mut query).await;
        assert_eq!(result, ResultType::Continue);
    }

    #[tokio::test]
    async fn blacklist_denies_listed_session() {
        let mut query = person_query("42", "hello");
        let result = run(config("blacklist", &["person_42"]), &mut query).await;
        assert_eq!(result, ResultType::Interrupt);
    }

    #[tokio::test]
    async fn person_wildcard_matches_every_person() {
        let mut query = person_query("anyone", "hello");
        let result = run(config("whitelist", &["person_*"]), &mut query).await;
        assert_eq!(result, ResultType::Continue);
    }

    #[tokio::test]
    async fn group_wildcard_does_not_match_person() {
        let mut query = person_query("42", "hello");
        let result = run(config("whitelist", &["group_*"]), &mut query).await;
        assert_eq!(result, ResultType::Interrupt);
    }

    #[tokio::test]
    async fn group_wildcard_matches_groups() {
        let mut query = crate::pipeline::stages::testing::group_query("g-7", "42", "hello");
        assert_eq!(query.launcher_type, LauncherType::Group);
        let result = run(config("whitelist", &["group_*"]), &mut query).await;
        assert_eq!(result, ResultType::Continue);
    }

    #[tokio::test]
    async fn denial_carries_no_user_notice() {
        let mut query = person_query("42", "hello");
        let ctx = test_context();
        let stage = BanSessionCheckStage::new(&config("whitelist", &["person_1"])).unwrap();
        let result = stage
            .process(&ctx, &mut query, "BanSessionCheckStage")
            .await
            .unwrap();
        assert_eq!(result.result_type, ResultType::Interrupt);
        assert!(result.user_notice.is_none());
    }

    #[tokio::test]
    async fn missing_config_defaults_to_open_blacklist() {
        let mut query = person_query("42", "hello");
        let result = run(serde_json::json!({}), &mut query).await;
        assert_eq!(result, ResultType::Continue);
    }
}

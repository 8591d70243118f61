use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::api::{CommonsApi, WikidataApi};
use crate::executor::{ExecutionContext, execute};
use crate::model::{Action, ActionId, ActionRecord, ActionStatus, PublishPlan};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionOutcome {
    pub id: ActionId,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PublishReport {
    pub success: bool,
    pub published: usize,
    pub failed: usize,
    pub blocked: usize,
    pub results: Vec<ActionOutcome>,
    pub commons_requests: usize,
    pub wikidata_requests: usize,
}

/// Drives the action set to completion, one action at a time.
///
/// Readiness is recomputed whenever an action completes; an action never
/// executes before its dependency reaches `Completed`, and siblings run in
/// the order they appear in the plan.
pub struct PublishScheduler {
    records: Vec<ActionRecord>,
}

impl PublishScheduler {
    pub fn new(mut plan: PublishPlan) -> Result<Self> {
        plan.link_dependencies()?;
        plan.validate()?;
        let mut scheduler = Self {
            records: plan.actions,
        };
        for index in 0..scheduler.records.len() {
            scheduler.refresh_readiness(index);
        }
        Ok(scheduler)
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn get(&self, id: &ActionId) -> Option<&ActionRecord> {
        self.records.iter().find(|record| &record.id == id)
    }

    /// Ready actions in insertion order.
    pub fn ready_ids(&self) -> Vec<ActionId> {
        self.records
            .iter()
            .filter(|record| record.status == ActionStatus::Ready)
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.records
            .iter()
            .all(|record| record.status.is_terminal())
    }

    /// Execute one ready action to completion. Rejects unknown ids, blocked
    /// actions and terminal actions; a completed action is never re-executed.
    pub fn publish_one<C: CommonsApi, W: WikidataApi>(
        &mut self,
        id: &ActionId,
        ctx: &mut ExecutionContext<'_, C, W>,
    ) -> Result<ActionOutcome> {
        let index = self
            .records
            .iter()
            .position(|record| &record.id == id)
            .ok_or_else(|| anyhow::anyhow!("unknown action: {id}"))?;

        match self.records[index].status {
            ActionStatus::Ready => {}
            ActionStatus::Completed | ActionStatus::Skipped => {
                bail!("action {id} is already finished")
            }
            ActionStatus::InProgress => bail!("action {id} is already running"),
            ActionStatus::Error => bail!("action {id} failed earlier; requeue it first"),
            ActionStatus::Pending => bail!("action {id} is blocked by its dependency"),
        }

        self.records[index].status = ActionStatus::InProgress;
        let result = execute(&self.records[index], ctx);

        match result {
            Ok(outcome) => {
                self.records[index].status = ActionStatus::Completed;
                self.records[index].error = None;
                info!(action = %id, "action completed");
                self.promote_dependents(index, outcome.uploaded_page_id);
                Ok(ActionOutcome {
                    id: id.clone(),
                    status: ActionStatus::Completed,
                    error: None,
                    detail: outcome.detail,
                })
            }
            Err(error) => {
                let message = error.to_string();
                self.records[index].status = ActionStatus::Error;
                self.records[index].error = Some(message.clone());
                debug!(action = %id, error = %message, "action failed");
                Ok(ActionOutcome {
                    id: id.clone(),
                    status: ActionStatus::Error,
                    error: Some(message),
                    detail: None,
                })
            }
        }
    }

    /// Drain the ready queue sequentially until nothing is ready. Failures
    /// never stop independent work; they only keep dependents blocked.
    pub fn publish_all<C: CommonsApi, W: WikidataApi>(
        &mut self,
        ctx: &mut ExecutionContext<'_, C, W>,
    ) -> Result<PublishReport> {
        let mut report = PublishReport::default();
        while let Some(id) = self.ready_ids().into_iter().next() {
            let outcome = self.publish_one(&id, ctx)?;
            match outcome.status {
                ActionStatus::Completed => report.published += 1,
                ActionStatus::Error => report.failed += 1,
                _ => {}
            }
            report.results.push(outcome);
        }
        report.blocked = self
            .records
            .iter()
            .filter(|record| record.status == ActionStatus::Pending)
            .count();
        report.success = report.failed == 0 && report.blocked == 0;
        report.commons_requests = ctx.commons.request_count();
        report.wikidata_requests = ctx.wikidata.request_count();
        Ok(report)
    }

    /// Return a failed action to the queue for a manual retry.
    pub fn requeue(&mut self, id: &ActionId) -> Result<()> {
        let index = self
            .records
            .iter()
            .position(|record| &record.id == id)
            .ok_or_else(|| anyhow::anyhow!("unknown action: {id}"))?;
        if self.records[index].status != ActionStatus::Error {
            bail!("action {id} is not in the error state");
        }
        self.records[index].status = ActionStatus::Pending;
        self.records[index].error = None;
        self.refresh_readiness(index);
        Ok(())
    }

    /// Mark an action as deliberately skipped. Terminal; its dependents can
    /// never become ready and surface as blocked.
    pub fn skip(&mut self, id: &ActionId) -> Result<()> {
        let index = self
            .records
            .iter()
            .position(|record| &record.id == id)
            .ok_or_else(|| anyhow::anyhow!("unknown action: {id}"))?;
        match self.records[index].status {
            ActionStatus::Pending | ActionStatus::Ready | ActionStatus::Error => {
                self.records[index].status = ActionStatus::Skipped;
                Ok(())
            }
            _ => bail!("action {id} cannot be skipped in its current state"),
        }
    }

    fn refresh_readiness(&mut self, index: usize) {
        if self.records[index].status != ActionStatus::Pending {
            return;
        }
        let ready = match &self.records[index].depends_on {
            None => true,
            Some(dependency_id) => self
                .records
                .iter()
                .find(|record| &record.id == dependency_id)
                .map(|record| record.status == ActionStatus::Completed)
                .unwrap_or(false),
        };
        if ready {
            self.records[index].status = ActionStatus::Ready;
        }
    }

    fn promote_dependents(&mut self, completed_index: usize, uploaded_page_id: Option<u64>) {
        let completed_id = self.records[completed_index].id.clone();
        for index in 0..self.records.len() {
            if self.records[index].depends_on.as_ref() != Some(&completed_id) {
                continue;
            }
            if let Some(page_id) = uploaded_page_id
                && let Action::StructuredData(sdc) = &mut self.records[index].action
            {
                sdc.commons_page_id = Some(page_id);
            }
            self.refresh_readiness(index);
        }
    }
}

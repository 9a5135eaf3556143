//! PostgreSQL `EngineStore`.
//!
//! Mirrors the in-memory semantics with real transactions: `FOR UPDATE SKIP
//! LOCKED` for candidate selection, a single transaction per multi-row write.
//! Schema is assumed present (via the embedder's own migration tooling);
//! this module only issues queries against it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{EngineStore, NewEvent, PeekFilter, ReservationRequest, StoreError};
use crate::domain::{
    Event, EventStatus, HandlerConfig, HandlerRun, HandlerState, HandlerStatus, HandlerType,
    Mutation, MutationOutcome, MutationStatus, Phase, PrepareResult, ResolvedBy, ScheduleSpec,
    ScriptRun, SessionOutcome, Topic, TriggerKind, Workflow, WorkflowStatus,
};
use crate::error::EngineError;

/// Connection-pooled store for production deployments.
#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    match s {
        "draft" => Ok(WorkflowStatus::Draft),
        "ready" => Ok(WorkflowStatus::Ready),
        "active" => Ok(WorkflowStatus::Active),
        "paused" => Ok(WorkflowStatus::Paused),
        "error" => Ok(WorkflowStatus::Error),
        "archived" => Ok(WorkflowStatus::Archived),
        other => Err(StoreError::Internal(format!("unknown workflow status {other}"))),
    }
}

fn parse_phase(s: &str) -> Result<Phase, StoreError> {
    match s {
        "pending" => Ok(Phase::Pending),
        "executing" => Ok(Phase::Executing),
        "preparing" => Ok(Phase::Preparing),
        "prepared" => Ok(Phase::Prepared),
        "mutating" => Ok(Phase::Mutating),
        "mutated" => Ok(Phase::Mutated),
        "emitting" => Ok(Phase::Emitting),
        "committed" => Ok(Phase::Committed),
        "failed" => Ok(Phase::Failed),
        other => Err(StoreError::Internal(format!("unknown phase {other}"))),
    }
}

fn parse_handler_type(s: &str) -> Result<HandlerType, StoreError> {
    match s {
        "producer" => Ok(HandlerType::Producer),
        "consumer" => Ok(HandlerType::Consumer),
        other => Err(StoreError::Internal(format!("unknown handler type {other}"))),
    }
}

fn parse_mutation_status(s: &str) -> Result<MutationStatus, StoreError> {
    match s {
        "pending" => Ok(MutationStatus::Pending),
        "in_flight" => Ok(MutationStatus::InFlight),
        "applied" => Ok(MutationStatus::Applied),
        "failed" => Ok(MutationStatus::Failed),
        "indeterminate" => Ok(MutationStatus::Indeterminate),
        other => Err(StoreError::Internal(format!("unknown mutation status {other}"))),
    }
}

fn parse_event_status(s: &str) -> Result<EventStatus, StoreError> {
    match s {
        "pending" => Ok(EventStatus::Pending),
        "reserved" => Ok(EventStatus::Reserved),
        "consumed" => Ok(EventStatus::Consumed),
        "skipped" => Ok(EventStatus::Skipped),
        other => Err(StoreError::Internal(format!("unknown event status {other}"))),
    }
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow, StoreError> {
    let status_str: String = row.get("status");
    let schedule_json: Option<serde_json::Value> = row.get("schedule");
    let handler_config_json: serde_json::Value = row.get("handler_config");
    Ok(Workflow {
        id: row.get("id"),
        title: row.get("title"),
        status: parse_workflow_status(&status_str)?,
        maintenance: row.get("maintenance"),
        schedule: schedule_json
            .map(|v| serde_json::from_value::<ScheduleSpec>(v))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        next_run_timestamp: row.get("next_run_timestamp"),
        pending_retry_run_id: row.get("pending_retry_run_id"),
        error: row.get("error"),
        handler_config: serde_json::from_value::<HandlerConfig>(handler_config_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        active_script_id: row.get("active_script_id"),
    })
}

fn row_to_handler_run(row: &sqlx::postgres::PgRow) -> Result<HandlerRun, StoreError> {
    let handler_type_str: String = row.get("handler_type");
    let phase_str: String = row.get("phase");
    let status_json: serde_json::Value = row.get("status");
    let prepare_result_json: Option<serde_json::Value> = row.get("prepare_result");
    let mutation_outcome_str: String = row.get("mutation_outcome");
    let error_json: Option<serde_json::Value> = row.get("error");
    let logs_json: serde_json::Value = row.get("logs");
    Ok(HandlerRun {
        id: row.get("id"),
        script_run_id: row.get("script_run_id"),
        workflow_id: row.get("workflow_id"),
        handler_type: parse_handler_type(&handler_type_str)?,
        handler_name: row.get("handler_name"),
        phase: parse_phase(&phase_str)?,
        status: serde_json::from_value::<HandlerStatus>(status_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        retry_of: row.get("retry_of"),
        prepare_result: prepare_result_json
            .map(|v| serde_json::from_value::<PrepareResult>(v))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        input_state: row.get("input_state"),
        output_state: row.get("output_state"),
        mutation_outcome: match mutation_outcome_str.as_str() {
            "none" => MutationOutcome::None,
            "success" => MutationOutcome::Success,
            "failure" => MutationOutcome::Failure,
            "skipped" => MutationOutcome::Skipped,
            other => {
                return Err(StoreError::Internal(format!(
                    "unknown mutation outcome {other}"
                )))
            }
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        error: error_json
            .map(|v| serde_json::from_value::<EngineError>(v))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        cost: row.get::<i64, _>("cost") as u64,
        logs: serde_json::from_value(logs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn row_to_mutation(row: &sqlx::postgres::PgRow) -> Result<Mutation, StoreError> {
    let status_str: String = row.get("status");
    let resolved_by_str: String = row.get("resolved_by");
    Ok(Mutation {
        id: row.get("id"),
        handler_run_id: row.get("handler_run_id"),
        namespace: row.get("namespace"),
        method: row.get("method"),
        params: row.get("params"),
        idempotency_key: row.get("idempotency_key"),
        status: parse_mutation_status(&status_str)?,
        result: row.get("result"),
        error: row.get("error"),
        reconciliation_attempts: row.get::<i32, _>("reconciliation_attempts") as u32,
        resolved_by: match resolved_by_str.as_str() {
            "none" => ResolvedBy::None,
            "user_skip" => ResolvedBy::UserSkip,
            "user_retry" => ResolvedBy::UserRetry,
            "user_assert_failed" => ResolvedBy::UserAssertFailed,
            other => return Err(StoreError::Internal(format!("unknown resolved_by {other}"))),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    let status_str: String = row.get("status");
    Ok(Event {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        message_id: row.get("message_id"),
        title: row.get("title"),
        payload: row.get("payload"),
        status: parse_event_status(&status_str)?,
        reserved_by_run_id: row.get("reserved_by_run_id"),
        created_by_run_id: row.get("created_by_run_id"),
        attempt: row.get::<i32, _>("attempt") as u32,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl EngineStore for PostgresEngineStore {
    #[instrument(skip(self, workflow))]
    async fn create_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        let schedule_json = workflow
            .schedule
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let handler_config_json = serde_json::to_value(&workflow.handler_config)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO relay_workflows
                (id, title, status, maintenance, schedule, next_run_timestamp,
                 pending_retry_run_id, error, handler_config, active_script_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.title)
        .bind(workflow.status.to_string())
        .bind(workflow.maintenance)
        .bind(&schedule_json)
        .bind(workflow.next_run_timestamp)
        .bind(workflow.pending_retry_run_id)
        .bind(&workflow.error)
        .bind(&handler_config_json)
        .bind(&workflow.active_script_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create workflow: {e}");
            StoreError::Database(e.to_string())
        })?;
        debug!(workflow_id = %workflow.id, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM relay_workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        row_to_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn list_due_workflows(&self, now: DateTime<Utc>) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM relay_workflows
            WHERE status = 'active' AND maintenance = false AND next_run_timestamp <= $1
            ORDER BY next_run_timestamp ASC
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn list_workflows_with_incomplete_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT workflow_id FROM relay_handler_runs
            WHERE phase NOT IN ('committed', 'failed')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("workflow_id")).collect())
    }

    async fn update_workflow_fields(
        &self,
        workflow_id: Uuid,
        mutate: Box<dyn FnOnce(&mut Workflow) + Send>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM relay_workflows WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let mut workflow = row_to_workflow(&row)?;
        mutate(&mut workflow);
        debug_assert!(workflow.error_invariant_holds());

        let schedule_json = workflow
            .schedule
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let handler_config_json = serde_json::to_value(&workflow.handler_config)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE relay_workflows SET
                title = $2, status = $3, maintenance = $4, schedule = $5,
                next_run_timestamp = $6, pending_retry_run_id = $7, error = $8,
                handler_config = $9, active_script_id = $10
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(&workflow.title)
        .bind(workflow.status.to_string())
        .bind(workflow.maintenance)
        .bind(&schedule_json)
        .bind(workflow.next_run_timestamp)
        .bind(workflow.pending_retry_run_id)
        .bind(&workflow.error)
        .bind(&handler_config_json)
        .bind(&workflow.active_script_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM relay_workflows WHERE id = $1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    async fn create_handler_run(&self, run: HandlerRun) -> Result<(), StoreError> {
        let status_json = serde_json::to_value(&run.status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let prepare_result_json = run
            .prepare_result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let error_json = run
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let logs_json =
            serde_json::to_value(&run.logs).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let handler_type = match run.handler_type {
            HandlerType::Producer => "producer",
            HandlerType::Consumer => "consumer",
        };
        let mutation_outcome = match run.mutation_outcome {
            MutationOutcome::None => "none",
            MutationOutcome::Success => "success",
            MutationOutcome::Failure => "failure",
            MutationOutcome::Skipped => "skipped",
        };
        sqlx::query(
            r#"
            INSERT INTO relay_handler_runs
                (id, script_run_id, workflow_id, handler_type, handler_name, phase,
                 status, retry_of, prepare_result, input_state, output_state,
                 mutation_outcome, created_at, updated_at, error, cost, logs)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            "#,
        )
        .bind(run.id)
        .bind(run.script_run_id)
        .bind(run.workflow_id)
        .bind(handler_type)
        .bind(&run.handler_name)
        .bind(phase_str(run.phase))
        .bind(&status_json)
        .bind(run.retry_of)
        .bind(&prepare_result_json)
        .bind(&run.input_state)
        .bind(&run.output_state)
        .bind(mutation_outcome)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(&error_json)
        .bind(run.cost as i64)
        .bind(&logs_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_handler_run(&self, run_id: Uuid) -> Result<HandlerRun, StoreError> {
        let row = sqlx::query("SELECT * FROM relay_handler_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        row_to_handler_run(&row)
    }

    async fn advance_handler_run(
        &self,
        run_id: Uuid,
        next_phase: Phase,
        state: Option<HandlerState>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM relay_handler_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        let mut run = row_to_handler_run(&row)?;
        run.advance(next_phase)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let status_json = serde_json::to_value(&run.status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "UPDATE relay_handler_runs SET phase = $2, status = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(run_id)
        .bind(phase_str(run.phase))
        .bind(&status_json)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(state) = state {
            sqlx::query(
                r#"
                INSERT INTO relay_handler_state (workflow_id, handler_name, data, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (workflow_id, handler_name) DO UPDATE SET
                    data = CASE WHEN EXCLUDED.updated_at >= relay_handler_state.updated_at
                                 THEN EXCLUDED.data ELSE relay_handler_state.data END,
                    updated_at = GREATEST(EXCLUDED.updated_at, relay_handler_state.updated_at)
                "#,
            )
            .bind(state.workflow_id)
            .bind(&state.handler_name)
            .bind(&state.data)
            .bind(state.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_handler_run_prepare_result(
        &self,
        run_id: Uuid,
        prepare_result: PrepareResult,
    ) -> Result<(), StoreError> {
        let prepare_result_json = serde_json::to_value(&prepare_result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE relay_handler_runs SET prepare_result = $2, updated_at = now() WHERE id = $1",
        )
        .bind(run_id)
        .bind(&prepare_result_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::HandlerRunNotFound(run_id));
        }
        Ok(())
    }

    async fn set_handler_run_mutation_outcome(
        &self,
        run_id: Uuid,
        outcome: MutationOutcome,
    ) -> Result<(), StoreError> {
        let outcome_str = match outcome {
            MutationOutcome::None => "none",
            MutationOutcome::Success => "success",
            MutationOutcome::Failure => "failure",
            MutationOutcome::Skipped => "skipped",
        };
        let result = sqlx::query(
            "UPDATE relay_handler_runs SET mutation_outcome = $2, updated_at = now() WHERE id = $1",
        )
        .bind(run_id)
        .bind(outcome_str)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::HandlerRunNotFound(run_id));
        }
        Ok(())
    }

    async fn fail_handler_run(&self, run_id: Uuid, error: EngineError) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM relay_handler_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        let mut run = row_to_handler_run(&row)?;
        run.fail(error);
        let status_json = serde_json::to_value(&run.status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let error_json = run
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"UPDATE relay_handler_runs SET phase = $2, status = $3, error = $4, updated_at = $5
               WHERE id = $1"#,
        )
        .bind(run_id)
        .bind(phase_str(run.phase))
        .bind(&status_json)
        .bind(&error_json)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_incomplete_handler_runs(&self) -> Result<Vec<HandlerRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM relay_handler_runs WHERE phase NOT IN ('committed', 'failed')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_handler_run).collect()
    }

    async fn create_mutation(&self, mutation: Mutation) -> Result<(), StoreError> {
        let status = mutation_status_str(mutation.status);
        let resolved_by = resolved_by_str(mutation.resolved_by);
        sqlx::query(
            r#"
            INSERT INTO relay_mutations
                (id, handler_run_id, namespace, method, params, idempotency_key,
                 status, result, error, reconciliation_attempts, resolved_by,
                 created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            "#,
        )
        .bind(mutation.id)
        .bind(mutation.handler_run_id)
        .bind(&mutation.namespace)
        .bind(&mutation.method)
        .bind(&mutation.params)
        .bind(&mutation.idempotency_key)
        .bind(status)
        .bind(&mutation.result)
        .bind(&mutation.error)
        .bind(mutation.reconciliation_attempts as i32)
        .bind(resolved_by)
        .bind(mutation.created_at)
        .bind(mutation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false)
            {
                StoreError::UniquenessViolation(format!(
                    "handler run {} already has a mutation",
                    mutation.handler_run_id
                ))
            } else {
                StoreError::Database(e.to_string())
            }
        })?;
        Ok(())
    }

    async fn get_mutation_by_handler_run(
        &self,
        handler_run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError> {
        let row = sqlx::query("SELECT * FROM relay_mutations WHERE handler_run_id = $1")
            .bind(handler_run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.as_ref().map(row_to_mutation).transpose()
    }

    async fn get_mutation(&self, mutation_id: Uuid) -> Result<Mutation, StoreError> {
        let row = sqlx::query("SELECT * FROM relay_mutations WHERE id = $1")
            .bind(mutation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::MutationNotFound(mutation_id))?;
        row_to_mutation(&row)
    }

    async fn update_mutation_status(
        &self,
        mutation_id: Uuid,
        status: MutationStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM relay_mutations WHERE id = $1 FOR UPDATE")
            .bind(mutation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::MutationNotFound(mutation_id))?;
        let mutation = row_to_mutation(&row)?;
        if !mutation.can_transition_to(status) {
            return Err(StoreError::Internal(format!(
                "illegal mutation transition {:?} -> {status:?}",
                mutation.status
            )));
        }
        sqlx::query(
            "UPDATE relay_mutations SET status = $2, result = $3, error = $4, updated_at = now() WHERE id = $1",
        )
        .bind(mutation_id)
        .bind(mutation_status_str(status))
        .bind(&result)
        .bind(&error)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_in_flight_mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM relay_mutations WHERE status = 'in_flight'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_mutation).collect()
    }

    async fn resolve_indeterminate_mutation(
        &self,
        mutation_id: Uuid,
        resolution: ResolvedBy,
    ) -> Result<(), StoreError> {
        if resolution == ResolvedBy::None {
            return Err(StoreError::Internal(
                "resolution must be one of UserSkip/UserRetry/UserAssertFailed".into(),
            ));
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM relay_mutations WHERE id = $1 FOR UPDATE")
            .bind(mutation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::MutationNotFound(mutation_id))?;
        let mutation = row_to_mutation(&row)?;
        if mutation.status != MutationStatus::Indeterminate {
            return Err(StoreError::Internal(format!(
                "mutation {mutation_id} is not indeterminate"
            )));
        }
        sqlx::query(
            "UPDATE relay_mutations SET status = 'failed', resolved_by = $2, updated_at = now() WHERE id = $1",
        )
        .bind(mutation_id)
        .bind(resolved_by_str(resolution))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let outcome = if resolution == ResolvedBy::UserSkip {
            "skipped"
        } else {
            "failure"
        };
        let run_row = sqlx::query("SELECT * FROM relay_handler_runs WHERE id = $1 FOR UPDATE")
            .bind(mutation.handler_run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::HandlerRunNotFound(mutation.handler_run_id))?;
        let run = row_to_handler_run(&run_row)?;

        sqlx::query(
            "UPDATE relay_handler_runs SET phase = 'mutated', mutation_outcome = $2, updated_at = now() WHERE id = $1",
        )
        .bind(mutation.handler_run_id)
        .bind(outcome)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        // `UserSkip` marks the run's reserved events skipped and leaves
        // them retired; `UserRetry`/`UserAssertFailed` release them back to
        // `pending` (bumping `attempt`) for a fresh consumer run to pick up.
        if resolution == ResolvedBy::UserSkip {
            sqlx::query(
                "UPDATE relay_events SET status = 'skipped' WHERE reserved_by_run_id = $1",
            )
            .bind(mutation.handler_run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        } else {
            sqlx::query(
                r#"
                UPDATE relay_events SET status = 'pending', reserved_by_run_id = NULL, attempt = attempt + 1
                WHERE reserved_by_run_id = $1
                "#,
            )
            .bind(mutation.handler_run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        let pending_retry_run_id = if resolution == ResolvedBy::UserSkip {
            Some(mutation.handler_run_id)
        } else {
            None
        };
        sqlx::query(
            r#"
            UPDATE relay_workflows SET pending_retry_run_id = $2, error = '', status = 'active'
            WHERE id = $1
            "#,
        )
        .bind(run.workflow_id)
        .bind(pending_retry_run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_or_create_topic(&self, workflow_id: Uuid, name: &str) -> Result<Topic, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO relay_topics (id, workflow_id, name, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (workflow_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, workflow_id, name, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Topic {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
    }

    async fn publish_event(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        event: NewEvent,
        producing_run_id: Uuid,
    ) -> Result<Event, StoreError> {
        let topic = self.get_or_create_topic(workflow_id, topic_name).await?;
        let row = sqlx::query(
            r#"
            INSERT INTO relay_events
                (id, topic_id, message_id, title, payload, status, reserved_by_run_id,
                 created_by_run_id, attempt, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', NULL, $6, 0, now())
            ON CONFLICT (topic_id, message_id) DO UPDATE SET topic_id = relay_events.topic_id
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(topic.id)
        .bind(&event.message_id)
        .bind(&event.title)
        .bind(&event.payload)
        .bind(producing_run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_event(&row)
    }

    async fn peek_events(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        filter: PeekFilter,
    ) -> Result<Vec<Event>, StoreError> {
        let status = filter.status.map(event_status_str);
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT e.* FROM relay_events e
            JOIN relay_topics t ON t.id = e.topic_id
            WHERE t.workflow_id = $1 AND t.name = $2
              AND ($3::text IS NULL OR e.status = $3)
            ORDER BY e.created_at ASC
            LIMIT $4
            "#,
        )
        .bind(workflow_id)
        .bind(topic_name)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_event).collect()
    }

    async fn get_events_by_ids(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        message_ids: &[String],
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.* FROM relay_events e
            JOIN relay_topics t ON t.id = e.topic_id
            WHERE t.workflow_id = $1 AND t.name = $2 AND e.message_id = ANY($3)
            "#,
        )
        .bind(workflow_id)
        .bind(topic_name)
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_event).collect()
    }

    async fn reserve_events(
        &self,
        run_id: Uuid,
        requests: Vec<ReservationRequest>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        for req in requests {
            sqlx::query(
                r#"
                UPDATE relay_events SET status = 'reserved', reserved_by_run_id = $1
                WHERE id = ANY($2) AND status = 'pending'
                "#,
            )
            .bind(run_id)
            .bind(&req.event_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn consume_events(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE relay_events SET status = 'consumed' WHERE reserved_by_run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn skip_events(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE relay_events SET status = 'skipped' WHERE reserved_by_run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn release_events(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE relay_events SET status = 'pending', reserved_by_run_id = NULL, attempt = attempt + 1
            WHERE reserved_by_run_id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM relay_handler_state WHERE workflow_id = $1 AND handler_name = $2",
        )
        .bind(workflow_id)
        .bind(handler_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(row.map(|r| HandlerState {
            workflow_id: r.get("workflow_id"),
            handler_name: r.get("handler_name"),
            data: r.get("data"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn put_handler_state(&self, state: HandlerState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO relay_handler_state (workflow_id, handler_name, data, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id, handler_name) DO UPDATE SET
                data = CASE WHEN EXCLUDED.updated_at >= relay_handler_state.updated_at
                             THEN EXCLUDED.data ELSE relay_handler_state.data END,
                updated_at = GREATEST(EXCLUDED.updated_at, relay_handler_state.updated_at)
            "#,
        )
        .bind(state.workflow_id)
        .bind(&state.handler_name)
        .bind(&state.data)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn create_script_run(
        &self,
        workflow_id: Uuid,
        trigger_kind: TriggerKind,
    ) -> Result<ScriptRun, StoreError> {
        let run = ScriptRun::new(workflow_id, trigger_kind);
        let outcome_json = serde_json::to_value(&run.outcome)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO relay_script_runs
                (id, workflow_id, trigger_kind, started_at, finished_at, outcome, handler_run_ids)
            VALUES ($1, $2, $3, $4, NULL, $5, '{}')
            "#,
        )
        .bind(run.id)
        .bind(run.workflow_id)
        .bind(trigger_kind_str(trigger_kind))
        .bind(run.started_at)
        .bind(&outcome_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(run)
    }

    async fn append_handler_run_to_session(
        &self,
        script_run_id: Uuid,
        handler_run_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE relay_script_runs SET handler_run_ids = array_append(handler_run_ids, $2) WHERE id = $1",
        )
        .bind(script_run_id)
        .bind(handler_run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Internal(format!(
                "script run {script_run_id} not found"
            )));
        }
        Ok(())
    }

    async fn finish_script_run(
        &self,
        script_run_id: Uuid,
        outcome: SessionOutcome,
    ) -> Result<(), StoreError> {
        let outcome_json =
            serde_json::to_value(&outcome).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE relay_script_runs SET outcome = $2, finished_at = now() WHERE id = $1",
        )
        .bind(script_run_id)
        .bind(&outcome_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Internal(format!(
                "script run {script_run_id} not found"
            )));
        }
        Ok(())
    }

    async fn get_script_run(&self, script_run_id: Uuid) -> Result<ScriptRun, StoreError> {
        let row = sqlx::query("SELECT * FROM relay_script_runs WHERE id = $1")
            .bind(script_run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::Internal(format!("script run {script_run_id} not found")))?;
        row_to_script_run(&row)
    }

    async fn latest_incomplete_script_run(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ScriptRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM relay_script_runs
            WHERE workflow_id = $1 AND finished_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row.as_ref().map(row_to_script_run).transpose()
    }
}

fn row_to_script_run(row: &sqlx::postgres::PgRow) -> Result<ScriptRun, StoreError> {
    let trigger_str: String = row.get("trigger_kind");
    let outcome_json: serde_json::Value = row.get("outcome");
    Ok(ScriptRun {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        trigger_kind: match trigger_str.as_str() {
            "schedule" => TriggerKind::Schedule,
            "retry" => TriggerKind::Retry,
            "resume" => TriggerKind::Resume,
            other => return Err(StoreError::Internal(format!("unknown trigger kind {other}"))),
        },
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        outcome: serde_json::from_value(outcome_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        handler_run_ids: row.get("handler_run_ids"),
    })
}

fn phase_str(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "pending",
        Phase::Executing => "executing",
        Phase::Preparing => "preparing",
        Phase::Prepared => "prepared",
        Phase::Mutating => "mutating",
        Phase::Mutated => "mutated",
        Phase::Emitting => "emitting",
        Phase::Committed => "committed",
        Phase::Failed => "failed",
    }
}

fn mutation_status_str(status: MutationStatus) -> &'static str {
    match status {
        MutationStatus::Pending => "pending",
        MutationStatus::InFlight => "in_flight",
        MutationStatus::Applied => "applied",
        MutationStatus::Failed => "failed",
        MutationStatus::Indeterminate => "indeterminate",
    }
}

fn resolved_by_str(resolved_by: ResolvedBy) -> &'static str {
    match resolved_by {
        ResolvedBy::None => "none",
        ResolvedBy::UserSkip => "user_skip",
        ResolvedBy::UserRetry => "user_retry",
        ResolvedBy::UserAssertFailed => "user_assert_failed",
    }
}

fn event_status_str(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Pending => "pending",
        EventStatus::Reserved => "reserved",
        EventStatus::Consumed => "consumed",
        EventStatus::Skipped => "skipped",
    }
}

fn trigger_kind_str(kind: TriggerKind) -> &'static str {
    match kind {
        TriggerKind::Schedule => "schedule",
        TriggerKind::Retry => "retry",
        TriggerKind::Resume => "resume",
    }
}

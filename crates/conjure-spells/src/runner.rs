//! The spell runner - cast execution
//!
//! State machine per cast: `running → (completed | failed | cancelled)`.
//! Step N+1 is never dispatched before step N's generation reaches terminal
//! `completed`; the reentry point is [`SpellRunner::continue_cast`], called
//! by the notification dispatcher with each step's terminal generation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use conjure_engine::{CostAuthorization, ExecutionEngine, ExecutionRequest};
use conjure_pricing::{CostQuoter, RateBook};
use conjure_registry::{RegistryError, ToolRegistry};
use conjure_store::{CastStore, GenerationStore};
use conjure_types::{
    BrokenBinding, CastId, CastStatus, DeliveryIntent, DeliveryStrategy, GenerationFailure,
    GenerationId, GenerationRecord, GenerationStatus, InputBinding, OrchestrationEvent, Platform,
    SpellCast, SpellDefinition, ToolId, UserId,
};

use crate::{Result, SpellBook, SpellError, SpellRef};

/// Declared schema migrations: old input name → new input name, per tool.
///
/// A stored cast that references a tool whose input schema renamed a field
/// is migrated through this table; anything unresolvable fails the cast
/// with a structured error naming the first broken binding.
#[derive(Default, Clone)]
pub struct FieldMigrations {
    renames: HashMap<ToolId, HashMap<String, String>>,
}

impl FieldMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rename(
        &mut self,
        tool_id: ToolId,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) {
        self.renames
            .entry(tool_id)
            .or_default()
            .insert(old_name.into(), new_name.into());
    }

    fn resolve(&self, tool_id: &ToolId, name: &str) -> String {
        self.renames
            .get(tool_id)
            .and_then(|renames| renames.get(name))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Executes spell casts, one engine generation per step
pub struct SpellRunner {
    book: Arc<SpellBook>,
    registry: Arc<ToolRegistry>,
    engine: Arc<ExecutionEngine>,
    casts: Arc<dyn CastStore>,
    generations: Arc<dyn GenerationStore>,
    rates: Arc<parking_lot::RwLock<RateBook>>,
    migrations: FieldMigrations,
    /// Per-cast serialization of start/continue
    locks: Mutex<HashMap<CastId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SpellRunner {
    pub fn new(
        book: Arc<SpellBook>,
        registry: Arc<ToolRegistry>,
        engine: Arc<ExecutionEngine>,
        casts: Arc<dyn CastStore>,
        generations: Arc<dyn GenerationStore>,
        rates: Arc<parking_lot::RwLock<RateBook>>,
        migrations: FieldMigrations,
    ) -> Self {
        Self {
            book,
            registry,
            engine,
            casts,
            generations,
            rates,
            migrations,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The definition store this runner resolves casts against.
    pub fn book(&self) -> Arc<SpellBook> {
        self.book.clone()
    }

    fn lock_for(&self, cast_id: &CastId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(cast_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start a cast: validate parameters, persist the cast record, and
    /// dispatch step 0.
    pub async fn cast(
        &self,
        reference: &SpellRef,
        raw_parameters: &Value,
        user: UserId,
        delivery: DeliveryIntent,
        platform: Platform,
    ) -> Result<SpellCast> {
        let definition = self.book.resolve(reference)?;
        definition.check_bindings().map_err(SpellError::Binding)?;

        let parameters = conjure_registry::validate_fields(
            &definition.parameters,
            false,
            raw_parameters,
        )
        .map_err(|errors| SpellError::Parameters {
            message: errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        })?;

        let now = Utc::now();
        let cast = SpellCast {
            id: CastId::new(),
            spell_id: definition.id.clone(),
            spell_version: definition.version,
            user: user.clone(),
            parameters: parameters.0.into_iter().collect(),
            generation_ids: Vec::new(),
            status: CastStatus::Running,
            current_step: 0,
            final_output: None,
            failed_step: None,
            accumulated_cost: conjure_types::CreditAmount::zero(),
            delivery,
            created_at: now,
            updated_at: now,
        };
        let cast_id = cast.id.clone();
        self.casts.create(cast).await.map_err(|e| SpellError::Store {
            message: e.to_string(),
        })?;

        let lock = self.lock_for(&cast_id);
        let _guard = lock.lock().await;
        if let Err(err) = self.start_step(&cast_id, &definition).await {
            tracing::warn!(cast = %cast_id, error = %err, "cast failed at step 0");
        }

        self.get_cast(&cast_id).await
    }

    pub async fn get_cast(&self, cast_id: &CastId) -> Result<SpellCast> {
        self.casts.get(cast_id).await.map_err(|e| SpellError::Store {
            message: e.to_string(),
        })
    }

    /// Reentry point from the notification dispatcher: one step of this
    /// cast reached a terminal state. Duplicate signals are no-ops.
    pub async fn continue_cast(
        &self,
        cast_id: &CastId,
        generation_id: &GenerationId,
    ) -> Result<()> {
        let lock = self.lock_for(cast_id);
        let _guard = lock.lock().await;

        let mut cast = self.get_cast(cast_id).await?;
        if cast.status.is_terminal() {
            return Ok(());
        }

        let record = self
            .generations
            .get(generation_id)
            .await
            .map_err(|e| SpellError::Store {
                message: e.to_string(),
            })?;
        if record.parent_cast_id.as_ref() != Some(cast_id) || !record.is_terminal() {
            return Ok(());
        }
        let Some(step_index) = record.step_index else {
            return Ok(());
        };
        // A duplicate of an already-processed step
        if step_index < cast.current_step {
            return Ok(());
        }

        self.append_generation(&mut cast, step_index, generation_id.clone());

        let definition = self
            .book
            .get_version(&cast.spell_id, cast.spell_version)?;

        match record.status {
            GenerationStatus::Completed => {
                let charged = record.cost.charged.unwrap_or(record.cost.quoted);
                cast.accumulated_cost = cast
                    .accumulated_cost
                    .checked_add(charged)
                    .unwrap_or(cast.accumulated_cost);

                if step_index + 1 >= definition.steps.len() {
                    cast.status = CastStatus::Completed;
                    cast.final_output = record.outputs.clone();
                    cast.updated_at = Utc::now();
                    self.save(&cast).await?;
                    tracing::info!(cast = %cast.id, "cast completed");
                    let _ = self.engine.events().send(OrchestrationEvent::CastCompleted {
                        cast_id: cast.id.clone(),
                        spell_id: cast.spell_id.clone(),
                        user: cast.user.clone(),
                        accumulated_cost: cast.accumulated_cost,
                        timestamp: Utc::now(),
                    });
                } else {
                    cast.current_step = step_index + 1;
                    cast.updated_at = Utc::now();
                    self.save(&cast).await?;
                    if let Err(err) = self.start_step(&cast.id, &definition).await {
                        tracing::warn!(cast = %cast.id, error = %err, "cast failed mid-flight");
                    }
                }
            }
            GenerationStatus::Failed => {
                let failure = record
                    .error
                    .clone()
                    .unwrap_or_else(|| GenerationFailure::new("BACKEND_ERROR", "step failed"));
                self.fail_cast(cast, step_index, failure).await?;
            }
            GenerationStatus::Cancelled => {
                cast.status = CastStatus::Cancelled;
                cast.updated_at = Utc::now();
                self.save(&cast).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Cancel a running cast: the cast record transitions immediately, and
    /// the in-flight child (if any) gets a best-effort engine cancel.
    pub async fn cancel_cast(&self, cast_id: &CastId) -> Result<CastStatus> {
        let running_child = {
            let lock = self.lock_for(cast_id);
            let _guard = lock.lock().await;

            let mut cast = self.get_cast(cast_id).await?;
            if cast.status.is_terminal() {
                return Ok(cast.status);
            }
            cast.status = CastStatus::Cancelled;
            cast.updated_at = Utc::now();
            self.save(&cast).await?;
            cast.generation_ids.last().cloned()
        };

        if let Some(child) = running_child {
            if let Err(err) = self.engine.cancel(&child).await {
                tracing::debug!(cast = %cast_id, error = %err, "child cancel after cast cancel");
            }
        }
        Ok(CastStatus::Cancelled)
    }

    /// Resolve bindings, re-quote, and hand the current step to the engine.
    /// Must run under the per-cast lock.
    async fn start_step(&self, cast_id: &CastId, definition: &SpellDefinition) -> Result<()> {
        let mut cast = self.get_cast(cast_id).await?;
        let step_index = cast.current_step;
        let Some(step) = definition.steps.get(step_index) else {
            return Err(SpellError::Binding(BrokenBinding {
                step_index,
                input: String::new(),
                reason: "step index out of range".to_string(),
            }));
        };

        let inputs = match self.resolve_step_inputs(&cast, definition, step_index).await {
            Ok(inputs) => inputs,
            Err(err) => {
                let failure = GenerationFailure::new("BAD_REQUEST", err.to_string());
                self.fail_cast(cast, step_index, failure).await?;
                return Err(err);
            }
        };

        let tool = self
            .registry
            .get(&step.tool_id)
            .map_err(|e| SpellError::Engine {
                message: e.to_string(),
            })?;

        // Execution-time re-quote with the actual resolved values
        let quote = {
            let rates = self.rates.read();
            CostQuoter::quote(&tool, &inputs, &rates).map_err(|e| SpellError::Engine {
                message: e.to_string(),
            })?
        };

        let is_final = step_index + 1 >= definition.steps.len();
        let request = ExecutionRequest {
            generation_id: None,
            user: cast.user.clone(),
            tool_id: step.tool_id.clone(),
            inputs,
            delivery_strategy: if is_final {
                DeliveryStrategy::SpellFinal
            } else {
                DeliveryStrategy::SpellStep
            },
            platform: cast.delivery.platform,
            delivery_address: cast.delivery.address.clone(),
            webhook: None,
            parent_cast_id: Some(cast.id.clone()),
            step_index: Some(step_index),
            quoted: quote.credits,
            authorization: CostAuthorization::Ledger,
        };

        match self.engine.execute(request).await {
            Ok(outcome) => {
                self.append_generation(&mut cast, step_index, outcome.generation_id);
                cast.updated_at = Utc::now();
                self.save(&cast).await
            }
            Err(err) => {
                let failure = GenerationFailure::from(&err);
                self.fail_cast(cast, step_index, failure).await?;
                Err(SpellError::Engine {
                    message: err.to_string(),
                })
            }
        }
    }

    /// Bind the step's inputs from literals, cast parameters, and prior
    /// step outputs (by declared output name).
    async fn resolve_step_inputs(
        &self,
        cast: &SpellCast,
        definition: &SpellDefinition,
        step_index: usize,
    ) -> Result<conjure_types::NormalizedInputs> {
        let step = &definition.steps[step_index];
        let mut raw = serde_json::Map::new();

        for (input_name, binding) in &step.bindings {
            let value = match binding {
                InputBinding::Literal { value } => value.clone(),
                InputBinding::Parameter { name } => cast
                    .parameters
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        SpellError::Binding(BrokenBinding {
                            step_index,
                            input: input_name.clone(),
                            reason: format!("parameter '{}' has no value", name),
                        })
                    })?,
                InputBinding::StepOutput { step: src, output } => {
                    let record = self.step_generation(cast, *src).await?;
                    record
                        .outputs
                        .as_ref()
                        .and_then(|outputs| outputs.get(output))
                        .cloned()
                        .ok_or_else(|| {
                            SpellError::Binding(BrokenBinding {
                                step_index,
                                input: input_name.clone(),
                                reason: format!("step {} produced no output '{}'", src, output),
                            })
                        })?
                }
            };
            let target = self.migrations.resolve(&step.tool_id, input_name);
            raw.insert(target, value);
        }

        self.registry
            .validate(&step.tool_id, &Value::Object(raw))
            .map_err(|err| match err {
                RegistryError::ValidationFailed { errors, .. } => {
                    let first = errors.first();
                    SpellError::Binding(BrokenBinding {
                        step_index,
                        input: first.map(|e| e.field.clone()).unwrap_or_default(),
                        reason: first
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "validation failed".to_string()),
                    })
                }
                other => SpellError::Engine {
                    message: other.to_string(),
                },
            })
    }

    async fn step_generation(
        &self,
        cast: &SpellCast,
        step_index: usize,
    ) -> Result<GenerationRecord> {
        let generation_id = cast.generation_ids.get(step_index).ok_or_else(|| {
            SpellError::Binding(BrokenBinding {
                step_index,
                input: String::new(),
                reason: "step has not run".to_string(),
            })
        })?;
        self.generations
            .get(generation_id)
            .await
            .map_err(|e| SpellError::Store {
                message: e.to_string(),
            })
    }

    async fn fail_cast(
        &self,
        mut cast: SpellCast,
        step_index: usize,
        failure: GenerationFailure,
    ) -> Result<()> {
        cast.status = CastStatus::Failed;
        cast.failed_step = Some(step_index);
        cast.updated_at = Utc::now();
        self.save(&cast).await?;
        tracing::warn!(cast = %cast.id, step = step_index, code = %failure.code, "cast failed");
        let _ = self.engine.events().send(OrchestrationEvent::CastFailed {
            cast_id: cast.id.clone(),
            spell_id: cast.spell_id.clone(),
            user: cast.user.clone(),
            failed_step: step_index,
            error: failure,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Append-only step list; duplicates by index are ignored.
    fn append_generation(
        &self,
        cast: &mut SpellCast,
        step_index: usize,
        generation_id: GenerationId,
    ) {
        if cast.generation_ids.len() == step_index {
            cast.generation_ids.push(generation_id);
        }
    }

    async fn save(&self, cast: &SpellCast) -> Result<()> {
        self.casts
            .update(cast.clone())
            .await
            .map_err(|e| SpellError::Store {
                message: e.to_string(),
            })
    }
}

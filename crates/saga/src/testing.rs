//! In-memory stand-ins for the services that execute saga commands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::TransactionId;
use messaging::{
    Broker, Consumer, ConsumerConfig, Envelope, Inbound, MessageHandler, OperationContext,
    Producer, RetryPolicy, TopicRegistry, emit,
};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::action::{Action, CurrencyType, STATUS_ERROR, command_topics};

/// Observable state of one character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterLedger {
    pub experience: i64,
    pub mesos: i64,
    pub fame: i64,
    /// Quantity held per item template.
    pub items: HashMap<u32, u32>,
    pub skills: HashMap<u32, u8>,
    pub quests_started: HashSet<u32>,
    pub quests_completed: HashSet<u32>,
    pub buddy_capacity: u32,
    pub closeness: HashMap<u32, u32>,
    pub effects: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Asset {
    character_id: u32,
    template_id: u32,
    compartment: String,
}

/// Everything the fake services have changed.
#[derive(Debug, Clone, Default)]
pub struct World {
    characters: HashMap<u32, CharacterLedger>,
    wallets: HashMap<(u32, CurrencyType), i64>,
    assets: HashMap<u32, Asset>,
    next_asset_id: u32,
    changes: usize,
}

impl World {
    pub fn character(&self, character_id: u32) -> CharacterLedger {
        self.characters
            .get(&character_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn wallet(&self, account_id: u32, currency: CurrencyType) -> i64 {
        self.wallets
            .get(&(account_id, currency))
            .copied()
            .unwrap_or_default()
    }

    /// Compartment an asset currently sits in.
    pub fn asset_compartment(&self, asset_id: u32) -> Option<&str> {
        self.assets.get(&asset_id).map(|a| a.compartment.as_str())
    }

    /// Number of commands that changed state.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Applies `action` and returns the success body, or the failure reason.
    fn apply(&mut self, action: &Action) -> Result<Value, String> {
        let body = match action {
            Action::AwardAsset(p) => {
                self.next_asset_id += 1;
                let asset_id = self.next_asset_id;
                self.assets.insert(
                    asset_id,
                    Asset {
                        character_id: p.character_id,
                        template_id: p.item.template_id,
                        compartment: "character".to_string(),
                    },
                );
                *self
                    .ledger(p.character_id)
                    .items
                    .entry(p.item.template_id)
                    .or_default() += p.item.quantity;
                json!({
                    "assetId": asset_id,
                    "templateId": p.item.template_id,
                    "quantity": p.item.quantity,
                })
            }
            Action::DestroyAsset(p) => {
                let held = self
                    .character(p.character_id)
                    .items
                    .get(&p.template_id)
                    .copied()
                    .unwrap_or_default();
                let quantity = if p.remove_all { held } else { p.quantity };
                if held < quantity {
                    return Err("ITEM_NOT_FOUND".to_string());
                }
                if let Some(id) = p.asset_id {
                    self.assets.remove(&id);
                } else if let Some(id) = self
                    .assets
                    .iter()
                    .find(|(_, a)| {
                        a.character_id == p.character_id && a.template_id == p.template_id
                    })
                    .map(|(id, _)| *id)
                {
                    self.assets.remove(&id);
                }
                let items = &mut self.ledger(p.character_id).items;
                items.insert(p.template_id, held - quantity);
                json!({"templateId": p.template_id, "quantity": quantity})
            }
            Action::AwardExperience(p) => {
                self.ledger(p.character_id).experience += p.total();
                json!({"amount": p.total()})
            }
            Action::AwardMesos(p) => {
                let ledger = self.ledger(p.character_id);
                let mesos = ledger.mesos + i64::from(p.amount);
                if mesos < 0 {
                    return Err("NOT_ENOUGH_MESO".to_string());
                }
                ledger.mesos = mesos;
                json!({"amount": p.amount, "mesos": mesos})
            }
            Action::AwardFame(p) => {
                self.ledger(p.character_id).fame += i64::from(p.amount);
                json!({"amount": p.amount})
            }
            Action::CreateSkill(p) => {
                self.ledger(p.character_id).skills.insert(p.skill_id, p.level);
                json!({"skillId": p.skill_id, "level": p.level})
            }
            Action::UpdateSkill(p) => {
                self.ledger(p.character_id).skills.insert(p.skill_id, p.level);
                json!({"skillId": p.skill_id, "level": p.level})
            }
            Action::QuestStart(p) => {
                self.ledger(p.character_id).quests_started.insert(p.quest_id);
                json!({"questId": p.quest_id})
            }
            Action::QuestComplete(p) => {
                self.ledger(p.character_id).quests_completed.insert(p.quest_id);
                json!({"questId": p.quest_id})
            }
            Action::AdjustCurrency(p) => {
                let balance = self.wallets.entry((p.account_id, p.currency_type)).or_default();
                *balance += i64::from(p.amount);
                json!({"accountId": p.account_id, "amount": p.amount, "balance": *balance})
            }
            Action::IncreaseCapacity(p) => {
                let ledger = self.ledger(p.character_id);
                ledger.buddy_capacity += u32::from(p.amount);
                json!({"capacity": ledger.buddy_capacity})
            }
            Action::AwardCloseness(p) => {
                *self
                    .ledger(p.character_id)
                    .closeness
                    .entry(p.pet_id)
                    .or_default() += u32::from(p.amount);
                json!({"petId": p.pet_id})
            }
            Action::ApplyConsumableEffect(p) => {
                self.ledger(p.character_id).effects.push(p.item_id);
                json!({"itemId": p.item_id})
            }
            Action::CompartmentTransfer(p) => {
                let asset = self
                    .assets
                    .get_mut(&p.asset_id)
                    .ok_or_else(|| "ASSET_NOT_FOUND".to_string())?;
                if asset.compartment != p.from {
                    return Err("ASSET_NOT_IN_COMPARTMENT".to_string());
                }
                asset.compartment = p.to.clone();
                json!({"assetId": p.asset_id, "compartment": p.to})
            }
        };
        self.changes += 1;
        Ok(body)
    }

    fn ledger(&mut self, character_id: u32) -> &mut CharacterLedger {
        self.characters.entry(character_id).or_default()
    }
}

/// Key under which a command's outcome is remembered.
type CommandKey = (TransactionId, String, String);

#[derive(Debug, Default)]
struct CollaboratorState {
    world: World,
    outcomes: HashMap<CommandKey, (String, Value)>,
    fail_on: HashMap<String, String>,
    silence: u32,
    received: usize,
}

/// Executes every saga command type against a shared [`World`] and answers
/// on the matching status topic.
///
/// Commands are idempotent by `(transactionId, type, body)`: a redelivered
/// command re-emits the status it first produced and changes nothing.
#[derive(Clone)]
pub struct FakeCollaborator {
    state: Arc<Mutex<CollaboratorState>>,
    producer: Arc<dyn Producer>,
}

impl FakeCollaborator {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            state: Arc::default(),
            producer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollaboratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers every command of `command_type` with an `ERROR` status.
    pub fn fail_on(&self, command_type: &str, reason: &str) {
        self.lock()
            .fail_on
            .insert(command_type.to_string(), reason.to_string());
    }

    /// Executes the next `count` commands without answering them, as if the
    /// status events were lost.
    pub fn silence_first(&self, count: u32) {
        self.lock().silence = count;
    }

    pub fn world(&self) -> World {
        self.lock().world.clone()
    }

    /// Number of command deliveries seen, duplicates included.
    pub fn received(&self) -> usize {
        self.lock().received
    }

    /// Starts one consumer per command topic.
    pub fn spawn(
        &self,
        broker: Arc<dyn Broker>,
        topics: Arc<TopicRegistry>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<messaging::Result<()>>> {
        let handler = Arc::new(self.clone());
        command_topics()
            .into_iter()
            .map(|topic| {
                let config =
                    ConsumerConfig::new(format!("fake:{topic}"), "fake-collaborators", topic)
                        .retry(RetryPolicy::none());
                Consumer::new(
                    config,
                    Arc::clone(&broker),
                    Arc::clone(&topics),
                    Arc::clone(&handler),
                )
                .spawn(shutdown.clone())
            })
            .collect()
    }

    /// Executes `action` and returns the status to report, or None when it
    /// must stay unanswered.
    fn execute(
        &self,
        id: TransactionId,
        kind: &str,
        body: &Value,
        action: &Action,
    ) -> Option<(String, Value)> {
        let mut state = self.lock();
        state.received += 1;

        let key = (id, kind.to_string(), body.to_string());
        let outcome = match state.outcomes.get(&key) {
            Some(outcome) => outcome.clone(),
            None => {
                let outcome = match state.fail_on.get(kind).cloned() {
                    Some(reason) => (STATUS_ERROR.to_string(), json!({ "reason": reason })),
                    None => match state.world.apply(action) {
                        Ok(body) => (action.success_type().to_string(), body),
                        Err(reason) => (STATUS_ERROR.to_string(), json!({ "reason": reason })),
                    },
                };
                state.outcomes.insert(key, outcome.clone());
                outcome
            }
        };

        if state.silence > 0 {
            state.silence -= 1;
            return None;
        }
        Some(outcome)
    }
}

#[async_trait]
impl MessageHandler for FakeCollaborator {
    type Payload = Envelope<Value>;

    async fn handle(
        &self,
        ctx: &OperationContext,
        message: Inbound<Self::Payload>,
    ) -> messaging::Result<()> {
        let command = message.payload;
        let parsed = Action::from_command(&message.topic, &command.kind, command.body.clone());
        let action = match parsed {
            Some(Ok(action)) => action,
            Some(Err(e)) => {
                tracing::warn!(kind = %command.kind, error = %e, "malformed command");
                return Ok(());
            }
            None => return Ok(()),
        };

        let Some((kind, body)) =
            self.execute(command.transaction_id, &command.kind, &command.body, &action)
        else {
            return Ok(());
        };

        let ctx = ctx.child();
        emit(self.producer.as_ref(), &ctx, |buffer| {
            buffer.put_envelope(
                action.status_topic(),
                message.key.clone(),
                &Envelope::new(command.transaction_id, kind, body).with_routing(action.routing()),
            )
        })
        .await
    }
}

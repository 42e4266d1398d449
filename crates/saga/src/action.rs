//! Step actions: typed payloads, the topics they travel on, and their
//! inverses.

use std::time::Duration;

use messaging::envelope::{Routing, partition_key};
use messaging::topic::{
    COMMAND_TOPIC_BUDDY_LIST, COMMAND_TOPIC_CHARACTER, COMMAND_TOPIC_COMPARTMENT,
    COMMAND_TOPIC_COMPARTMENT_TRANSFER, COMMAND_TOPIC_CONSUMABLE, COMMAND_TOPIC_PET,
    COMMAND_TOPIC_QUEST, COMMAND_TOPIC_SKILL, COMMAND_TOPIC_WALLET, EVENT_TOPIC_ASSET_STATUS,
    EVENT_TOPIC_BUDDY_LIST_STATUS, EVENT_TOPIC_CHARACTER_STATUS,
    EVENT_TOPIC_COMPARTMENT_TRANSFER_STATUS, EVENT_TOPIC_CONSUMABLE_STATUS, EVENT_TOPIC_PET_STATUS,
    EVENT_TOPIC_QUEST_STATUS, EVENT_TOPIC_SKILL_STATUS, EVENT_TOPIC_WALLET_STATUS,
};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};

/// Status event type every domain status topic uses to report failure.
pub const STATUS_ERROR: &str = "ERROR";

/// Timeout class of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Handled by one service against local state.
    Fast,
    /// Fans out across services before the status event is produced.
    MultiHop,
}

/// How long to wait for a step's status event and how many dispatches to
/// try before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl ActionClass {
    pub fn default_policy(&self) -> StepPolicy {
        match self {
            ActionClass::Fast => StepPolicy {
                timeout: Duration::from_secs(5),
                max_attempts: 3,
            },
            ActionClass::MultiHop => StepPolicy {
                timeout: Duration::from_secs(15),
                max_attempts: 5,
            },
        }
    }
}

/// Static description of one action kind.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub name: &'static str,
    pub command_topic: &'static str,
    pub command_type: &'static str,
    pub status_topic: &'static str,
    pub success_type: &'static str,
    pub class: ActionClass,
}

const fn spec(
    name: &'static str,
    command_topic: &'static str,
    command_type: &'static str,
    status_topic: &'static str,
    success_type: &'static str,
    class: ActionClass,
) -> ActionSpec {
    ActionSpec {
        name,
        command_topic,
        command_type,
        status_topic,
        success_type,
        class,
    }
}

/// Every action the engine knows how to dispatch, in variant order.
#[rustfmt::skip]
pub const CATALOGUE: &[ActionSpec] = &[
    spec("AwardAsset", COMMAND_TOPIC_COMPARTMENT, "CREATE_ASSET", EVENT_TOPIC_ASSET_STATUS, "CREATED", ActionClass::MultiHop),
    spec("DestroyAsset", COMMAND_TOPIC_COMPARTMENT, "DESTROY_ASSET", EVENT_TOPIC_ASSET_STATUS, "DELETED", ActionClass::MultiHop),
    spec("AwardExperience", COMMAND_TOPIC_CHARACTER, "AWARD_EXPERIENCE", EVENT_TOPIC_CHARACTER_STATUS, "STAT_CHANGED", ActionClass::Fast),
    spec("AwardMesos", COMMAND_TOPIC_CHARACTER, "REQUEST_CHANGE_MESO", EVENT_TOPIC_CHARACTER_STATUS, "MESO_CHANGED", ActionClass::Fast),
    spec("AwardFame", COMMAND_TOPIC_CHARACTER, "REQUEST_CHANGE_FAME", EVENT_TOPIC_CHARACTER_STATUS, "FAME_CHANGED", ActionClass::Fast),
    spec("CreateSkill", COMMAND_TOPIC_SKILL, "REQUEST_CREATE", EVENT_TOPIC_SKILL_STATUS, "CREATED", ActionClass::Fast),
    spec("UpdateSkill", COMMAND_TOPIC_SKILL, "REQUEST_UPDATE", EVENT_TOPIC_SKILL_STATUS, "UPDATED", ActionClass::Fast),
    spec("QuestStart", COMMAND_TOPIC_QUEST, "START", EVENT_TOPIC_QUEST_STATUS, "STARTED", ActionClass::MultiHop),
    spec("QuestComplete", COMMAND_TOPIC_QUEST, "COMPLETE", EVENT_TOPIC_QUEST_STATUS, "COMPLETED", ActionClass::MultiHop),
    spec("AdjustCurrency", COMMAND_TOPIC_WALLET, "ADJUST_CURRENCY", EVENT_TOPIC_WALLET_STATUS, "UPDATED", ActionClass::Fast),
    spec("IncreaseCapacity", COMMAND_TOPIC_BUDDY_LIST, "INCREASE_CAPACITY", EVENT_TOPIC_BUDDY_LIST_STATUS, "CAPACITY_CHANGE", ActionClass::Fast),
    spec("AwardCloseness", COMMAND_TOPIC_PET, "AWARD_CLOSENESS", EVENT_TOPIC_PET_STATUS, "CLOSENESS_CHANGED", ActionClass::Fast),
    spec("ApplyConsumableEffect", COMMAND_TOPIC_CONSUMABLE, "APPLY_CONSUMABLE_EFFECT", EVENT_TOPIC_CONSUMABLE_STATUS, "EFFECT_APPLIED", ActionClass::MultiHop),
    spec("CompartmentTransfer", COMMAND_TOPIC_COMPARTMENT_TRANSFER, "TRANSFER", EVENT_TOPIC_COMPARTMENT_TRANSFER_STATUS, "COMPLETED", ActionClass::MultiHop),
];

/// Command topics with at least one action.
pub fn command_topics() -> Vec<&'static str> {
    let mut topics: Vec<&'static str> = CATALOGUE.iter().map(|s| s.command_topic).collect();
    topics.sort_unstable();
    topics.dedup();
    topics
}

/// Status topics the engine listens on.
pub fn status_topics() -> Vec<&'static str> {
    let mut topics: Vec<&'static str> = CATALOGUE.iter().map(|s| s.status_topic).collect();
    topics.sort_unstable();
    topics.dedup();
    topics
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    pub template_id: u32,
    pub quantity: u32,
    #[serde(default)]
    pub period: u32,
    #[serde(default)]
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardAssetPayload {
    pub character_id: u32,
    pub item: ItemPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyAssetPayload {
    pub character_id: u32,
    pub template_id: u32,
    pub quantity: u32,
    #[serde(default)]
    pub remove_all: bool,
    /// Targets one asset instead of any asset of the template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceDistribution {
    pub experience_type: String,
    pub amount: i32,
    #[serde(default)]
    pub attr1: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardExperiencePayload {
    pub character_id: u32,
    pub world_id: u8,
    pub channel_id: u8,
    pub distributions: Vec<ExperienceDistribution>,
}

impl AwardExperiencePayload {
    pub fn total(&self) -> i64 {
        self.distributions.iter().map(|d| i64::from(d.amount)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardMesosPayload {
    pub character_id: u32,
    pub world_id: u8,
    pub channel_id: u8,
    pub actor_id: u32,
    pub actor_type: String,
    pub amount: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardFamePayload {
    pub character_id: u32,
    pub world_id: u8,
    pub channel_id: u8,
    pub actor_id: u32,
    pub actor_type: String,
    pub amount: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSkillPayload {
    pub character_id: u32,
    pub skill_id: u32,
    pub level: u8,
    pub master_level: u8,
    #[serde(default)]
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillLevels {
    pub level: u8,
    pub master_level: u8,
    #[serde(default)]
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSkillPayload {
    pub character_id: u32,
    pub skill_id: u32,
    pub level: u8,
    pub master_level: u8,
    #[serde(default)]
    pub expiration: i64,
    /// Values before the update. Without them the update cannot be undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<SkillLevels>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestPayload {
    pub character_id: u32,
    pub world_id: u8,
    pub channel_id: u8,
    pub quest_id: u32,
    #[serde(default)]
    pub npc_id: u32,
    #[serde(default)]
    pub force: bool,
}

/// Wallet currency, encoded as 1 (credit), 2 (points) or 3 (prepaid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CurrencyType {
    Credit,
    Points,
    Prepaid,
}

impl TryFrom<u8> for CurrencyType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CurrencyType::Credit),
            2 => Ok(CurrencyType::Points),
            3 => Ok(CurrencyType::Prepaid),
            other => Err(format!("unknown currency type {other}")),
        }
    }
}

impl From<CurrencyType> for u8 {
    fn from(value: CurrencyType) -> Self {
        match value {
            CurrencyType::Credit => 1,
            CurrencyType::Points => 2,
            CurrencyType::Prepaid => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustCurrencyPayload {
    pub character_id: u32,
    pub account_id: u32,
    pub currency_type: CurrencyType,
    pub amount: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncreaseCapacityPayload {
    pub character_id: u32,
    pub world_id: u8,
    pub amount: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardClosenessPayload {
    pub character_id: u32,
    pub pet_id: u32,
    pub amount: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumableEffectPayload {
    pub character_id: u32,
    pub world_id: u8,
    pub channel_id: u8,
    pub item_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompartmentTransferPayload {
    pub character_id: u32,
    pub account_id: u32,
    pub asset_id: u32,
    /// Source compartment, e.g. `character`, `storage`, `cash`.
    pub from: String,
    pub to: String,
}

/// One step's work.
///
/// Serialized as `{"action": <name>, "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum Action {
    AwardAsset(AwardAssetPayload),
    DestroyAsset(DestroyAssetPayload),
    AwardExperience(AwardExperiencePayload),
    AwardMesos(AwardMesosPayload),
    AwardFame(AwardFamePayload),
    CreateSkill(CreateSkillPayload),
    UpdateSkill(UpdateSkillPayload),
    QuestStart(QuestPayload),
    QuestComplete(QuestPayload),
    AdjustCurrency(AdjustCurrencyPayload),
    IncreaseCapacity(IncreaseCapacityPayload),
    AwardCloseness(AwardClosenessPayload),
    ApplyConsumableEffect(ConsumableEffectPayload),
    CompartmentTransfer(CompartmentTransferPayload),
}

/// Serializes as the bare payload of an action.
pub struct PayloadOf<'a>(pub &'a Action);

impl Serialize for PayloadOf<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Action::AwardAsset(p) => p.serialize(serializer),
            Action::DestroyAsset(p) => p.serialize(serializer),
            Action::AwardExperience(p) => p.serialize(serializer),
            Action::AwardMesos(p) => p.serialize(serializer),
            Action::AwardFame(p) => p.serialize(serializer),
            Action::CreateSkill(p) => p.serialize(serializer),
            Action::UpdateSkill(p) => p.serialize(serializer),
            Action::QuestStart(p) | Action::QuestComplete(p) => p.serialize(serializer),
            Action::AdjustCurrency(p) => p.serialize(serializer),
            Action::IncreaseCapacity(p) => p.serialize(serializer),
            Action::AwardCloseness(p) => p.serialize(serializer),
            Action::ApplyConsumableEffect(p) => p.serialize(serializer),
            Action::CompartmentTransfer(p) => p.serialize(serializer),
        }
    }
}

/// What undoing a completed step takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inverse {
    /// Dispatch this command and wait for its success.
    Command(Action),
    /// Nothing to undo.
    NoOp,
    /// The step cannot be undone.
    None,
}

impl Action {
    /// Rebuilds an action from its name and JSON payload.
    pub fn from_parts(name: &str, payload: Value) -> serde_json::Result<Self> {
        serde_json::from_value(json!({ "action": name, "payload": payload }))
    }

    /// Rebuilds an action from a command as it appears on the bus.
    ///
    /// Returns None for commands the catalogue does not describe.
    pub fn from_command(
        command_topic: &str,
        command_type: &str,
        body: Value,
    ) -> Option<serde_json::Result<Self>> {
        CATALOGUE
            .iter()
            .find(|s| s.command_topic == command_topic && s.command_type == command_type)
            .map(|s| Self::from_parts(s.name, body))
    }

    fn catalogue_index(&self) -> usize {
        match self {
            Action::AwardAsset(_) => 0,
            Action::DestroyAsset(_) => 1,
            Action::AwardExperience(_) => 2,
            Action::AwardMesos(_) => 3,
            Action::AwardFame(_) => 4,
            Action::CreateSkill(_) => 5,
            Action::UpdateSkill(_) => 6,
            Action::QuestStart(_) => 7,
            Action::QuestComplete(_) => 8,
            Action::AdjustCurrency(_) => 9,
            Action::IncreaseCapacity(_) => 10,
            Action::AwardCloseness(_) => 11,
            Action::ApplyConsumableEffect(_) => 12,
            Action::CompartmentTransfer(_) => 13,
        }
    }

    pub fn spec(&self) -> &'static ActionSpec {
        &CATALOGUE[self.catalogue_index()]
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn command_topic(&self) -> &'static str {
        self.spec().command_topic
    }

    pub fn command_type(&self) -> &'static str {
        self.spec().command_type
    }

    pub fn status_topic(&self) -> &'static str {
        self.spec().status_topic
    }

    pub fn success_type(&self) -> &'static str {
        self.spec().success_type
    }

    pub fn default_policy(&self) -> StepPolicy {
        self.spec().class.default_policy()
    }

    /// The command body: the payload without the action name.
    pub fn payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(PayloadOf(self))
    }

    pub fn character_id(&self) -> u32 {
        match self {
            Action::AwardAsset(p) => p.character_id,
            Action::DestroyAsset(p) => p.character_id,
            Action::AwardExperience(p) => p.character_id,
            Action::AwardMesos(p) => p.character_id,
            Action::AwardFame(p) => p.character_id,
            Action::CreateSkill(p) => p.character_id,
            Action::UpdateSkill(p) => p.character_id,
            Action::QuestStart(p) | Action::QuestComplete(p) => p.character_id,
            Action::AdjustCurrency(p) => p.character_id,
            Action::IncreaseCapacity(p) => p.character_id,
            Action::AwardCloseness(p) => p.character_id,
            Action::ApplyConsumableEffect(p) => p.character_id,
            Action::CompartmentTransfer(p) => p.character_id,
        }
    }

    /// Partition key for the command and its status events.
    ///
    /// Wallet commands order by account; everything else by character.
    pub fn partition_key(&self) -> Vec<u8> {
        match self {
            Action::AdjustCurrency(p) => partition_key(p.account_id.into()),
            other => partition_key(other.character_id().into()),
        }
    }

    /// Routing fields carried next to the command body.
    pub fn routing(&self) -> Routing {
        let routing = Routing::character(self.character_id());
        match self {
            Action::AwardExperience(AwardExperiencePayload {
                world_id,
                channel_id,
                ..
            })
            | Action::AwardMesos(AwardMesosPayload {
                world_id,
                channel_id,
                ..
            })
            | Action::AwardFame(AwardFamePayload {
                world_id,
                channel_id,
                ..
            })
            | Action::QuestStart(QuestPayload {
                world_id,
                channel_id,
                ..
            })
            | Action::QuestComplete(QuestPayload {
                world_id,
                channel_id,
                ..
            })
            | Action::ApplyConsumableEffect(ConsumableEffectPayload {
                world_id,
                channel_id,
                ..
            }) => routing.world(*world_id).channel(*channel_id),
            Action::IncreaseCapacity(p) => routing.world(p.world_id),
            Action::AdjustCurrency(p) => routing.account(p.account_id),
            Action::CompartmentTransfer(p) => routing.account(p.account_id),
            _ => routing,
        }
    }

    /// Whether a status event body could answer this command.
    ///
    /// Checks the identifying fields a collaborator echoes back (amounts,
    /// ids, target compartment). Fields the body omits are not checked, so
    /// this only rejects events that provably belong to another command of
    /// the same type, such as a redelivered status of an earlier step.
    pub fn matches_status(&self, body: &Value) -> bool {
        let echoed = match self {
            Action::AwardAsset(p) => json!({
                "templateId": p.item.template_id,
                "quantity": p.item.quantity,
            }),
            Action::DestroyAsset(p) if p.remove_all => json!({ "templateId": p.template_id }),
            Action::DestroyAsset(p) => json!({
                "templateId": p.template_id,
                "quantity": p.quantity,
            }),
            Action::AwardExperience(p) => json!({ "amount": p.total() }),
            Action::AwardMesos(p) => json!({ "amount": p.amount }),
            Action::AwardFame(p) => json!({ "amount": p.amount }),
            Action::CreateSkill(p) => json!({ "skillId": p.skill_id, "level": p.level }),
            Action::UpdateSkill(p) => json!({ "skillId": p.skill_id, "level": p.level }),
            Action::QuestStart(p) | Action::QuestComplete(p) => json!({ "questId": p.quest_id }),
            Action::AdjustCurrency(p) => json!({
                "accountId": p.account_id,
                "amount": p.amount,
            }),
            Action::IncreaseCapacity(_) => json!({}),
            Action::AwardCloseness(p) => json!({ "petId": p.pet_id }),
            Action::ApplyConsumableEffect(p) => json!({ "itemId": p.item_id }),
            Action::CompartmentTransfer(p) => json!({
                "assetId": p.asset_id,
                "compartment": p.to,
            }),
        };

        let Value::Object(expected) = echoed else {
            return true;
        };
        expected.iter().all(|(field, want)| match body.get(field) {
            None => true,
            Some(got) => same_value(got, want),
        })
    }

    /// The inverse of this action once it has completed.
    ///
    /// `result` is the body of the status event that completed the step.
    pub fn inverse(&self, result: Option<&Value>) -> Inverse {
        match self {
            Action::AwardAsset(p) => Inverse::Command(Action::DestroyAsset(DestroyAssetPayload {
                character_id: p.character_id,
                template_id: p.item.template_id,
                quantity: p.item.quantity,
                remove_all: false,
                asset_id: result
                    .and_then(|r| r.get("assetId"))
                    .and_then(Value::as_u64)
                    .and_then(|id| u32::try_from(id).ok()),
            })),
            Action::DestroyAsset(p) => Inverse::Command(Action::AwardAsset(AwardAssetPayload {
                character_id: p.character_id,
                item: ItemPayload {
                    template_id: p.template_id,
                    quantity: p.quantity,
                    period: 0,
                    expiration: 0,
                },
            })),
            Action::AwardExperience(_) => Inverse::None,
            Action::AwardMesos(p) => Inverse::Command(Action::AwardMesos(AwardMesosPayload {
                amount: p.amount.saturating_neg(),
                ..p.clone()
            })),
            Action::AwardFame(p) => Inverse::Command(Action::AwardFame(AwardFamePayload {
                amount: p.amount.saturating_neg(),
                ..p.clone()
            })),
            Action::UpdateSkill(p) => match &p.previous {
                Some(previous) => Inverse::Command(Action::UpdateSkill(UpdateSkillPayload {
                    character_id: p.character_id,
                    skill_id: p.skill_id,
                    level: previous.level,
                    master_level: previous.master_level,
                    expiration: previous.expiration,
                    previous: Some(SkillLevels {
                        level: p.level,
                        master_level: p.master_level,
                        expiration: p.expiration,
                    }),
                })),
                None => Inverse::None,
            },
            Action::AdjustCurrency(p) => {
                Inverse::Command(Action::AdjustCurrency(AdjustCurrencyPayload {
                    amount: p.amount.saturating_neg(),
                    ..p.clone()
                }))
            }
            Action::CompartmentTransfer(p) => {
                Inverse::Command(Action::CompartmentTransfer(CompartmentTransferPayload {
                    from: p.to.clone(),
                    to: p.from.clone(),
                    ..p.clone()
                }))
            }
            Action::CreateSkill(_)
            | Action::QuestStart(_)
            | Action::QuestComplete(_)
            | Action::IncreaseCapacity(_)
            | Action::AwardCloseness(_)
            | Action::ApplyConsumableEffect(_) => Inverse::NoOp,
        }
    }
}

/// JSON equality that treats `5`, `5.0` and `-0` alike.
fn same_value(got: &Value, want: &Value) -> bool {
    match (got.as_f64(), want.as_f64()) {
        (Some(g), Some(w)) => g == w,
        _ => got == want,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn award_item(template_id: u32, quantity: u32) -> Action {
        Action::AwardAsset(AwardAssetPayload {
            character_id: 42,
            item: ItemPayload {
                template_id,
                quantity,
                period: 0,
                expiration: 0,
            },
        })
    }

    #[test]
    fn catalogue_order_matches_variant_names() {
        for spec in CATALOGUE {
            let action = Action::from_parts(spec.name, sample_payload(spec.name)).unwrap();
            assert_eq!(action.name(), spec.name);
        }
    }

    fn sample_payload(name: &str) -> Value {
        match name {
            "AwardAsset" => json!({"characterId": 1, "item": {"templateId": 1, "quantity": 1}}),
            "DestroyAsset" => json!({"characterId": 1, "templateId": 1, "quantity": 1}),
            "AwardExperience" => json!({"characterId": 1, "worldId": 0, "channelId": 0, "distributions": []}),
            "AwardMesos" | "AwardFame" => json!({"characterId": 1, "worldId": 0, "channelId": 0, "actorId": 0, "actorType": "SYSTEM", "amount": 1}),
            "CreateSkill" | "UpdateSkill" => json!({"characterId": 1, "skillId": 1, "level": 1, "masterLevel": 1}),
            "QuestStart" | "QuestComplete" => json!({"characterId": 1, "worldId": 0, "channelId": 0, "questId": 1}),
            "AdjustCurrency" => json!({"characterId": 1, "accountId": 1, "currencyType": 1, "amount": 1}),
            "IncreaseCapacity" => json!({"characterId": 1, "worldId": 0, "amount": 1}),
            "AwardCloseness" => json!({"characterId": 1, "petId": 1, "amount": 1}),
            "ApplyConsumableEffect" => json!({"characterId": 1, "worldId": 0, "channelId": 0, "itemId": 1}),
            "CompartmentTransfer" => json!({"characterId": 1, "accountId": 1, "assetId": 1, "from": "character", "to": "storage"}),
            other => panic!("no sample for {other}"),
        }
    }

    #[test]
    fn serializes_with_action_and_payload() {
        let value = serde_json::to_value(award_item(2000000, 3)).unwrap();
        assert_eq!(value["action"], "AwardAsset");
        assert_eq!(value["payload"]["item"]["templateId"], 2000000);
        assert_eq!(value["payload"]["characterId"], 42);
    }

    #[test]
    fn rebuilds_from_command() {
        let action = award_item(2000000, 3);
        let rebuilt = Action::from_command(
            COMMAND_TOPIC_COMPARTMENT,
            "CREATE_ASSET",
            action.payload().unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(rebuilt, action);
        assert!(Action::from_command(COMMAND_TOPIC_COMPARTMENT, "SORT", json!({})).is_none());
    }

    #[test]
    fn unknown_action_name_is_rejected() {
        assert!(Action::from_parts("TeleportEverywhere", json!({})).is_err());
    }

    #[test]
    fn award_asset_inverse_uses_created_asset_id() {
        let result = json!({"assetId": 7001, "templateId": 2000000});
        let Inverse::Command(Action::DestroyAsset(p)) =
            award_item(2000000, 3).inverse(Some(&result))
        else {
            panic!("expected DestroyAsset");
        };
        assert_eq!(p.template_id, 2000000);
        assert_eq!(p.quantity, 3);
        assert_eq!(p.asset_id, Some(7001));

        let Inverse::Command(Action::DestroyAsset(p)) = award_item(2000000, 3).inverse(None)
        else {
            panic!("expected DestroyAsset");
        };
        assert_eq!(p.asset_id, None);
    }

    #[test]
    fn meso_and_currency_inverses_negate() {
        let mesos = Action::AwardMesos(AwardMesosPayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            actor_id: 9,
            actor_type: "NPC".to_string(),
            amount: -250,
        });
        assert!(matches!(
            mesos.inverse(None),
            Inverse::Command(Action::AwardMesos(AwardMesosPayload { amount: 250, .. }))
        ));

        let wallet = Action::AdjustCurrency(AdjustCurrencyPayload {
            character_id: 42,
            account_id: 7,
            currency_type: CurrencyType::Credit,
            amount: -1000,
        });
        assert!(matches!(
            wallet.inverse(None),
            Inverse::Command(Action::AdjustCurrency(AdjustCurrencyPayload { amount: 1000, .. }))
        ));
    }

    #[test]
    fn experience_has_no_inverse_and_quests_are_no_ops() {
        let exp = Action::AwardExperience(AwardExperiencePayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            distributions: vec![ExperienceDistribution {
                experience_type: "WHITE".to_string(),
                amount: 500,
                attr1: 0,
            }],
        });
        assert_eq!(exp.inverse(None), Inverse::None);

        let quest = Action::QuestComplete(QuestPayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            quest_id: 100,
            npc_id: 0,
            force: false,
        });
        assert_eq!(quest.inverse(None), Inverse::NoOp);
    }

    #[test]
    fn update_skill_is_only_reversible_with_previous_values() {
        let mut payload = UpdateSkillPayload {
            character_id: 42,
            skill_id: 1001004,
            level: 10,
            master_level: 20,
            expiration: 0,
            previous: None,
        };
        assert_eq!(
            Action::UpdateSkill(payload.clone()).inverse(None),
            Inverse::None
        );

        payload.previous = Some(SkillLevels {
            level: 5,
            master_level: 20,
            expiration: 0,
        });
        let Inverse::Command(Action::UpdateSkill(inverse)) =
            Action::UpdateSkill(payload).inverse(None)
        else {
            panic!("expected UpdateSkill");
        };
        assert_eq!(inverse.level, 5);
        assert_eq!(inverse.previous.map(|p| p.level), Some(10));
    }

    #[test]
    fn status_body_must_echo_the_command() {
        let spend = Action::AwardMesos(AwardMesosPayload {
            character_id: 42,
            world_id: 0,
            channel_id: 1,
            actor_id: 9,
            actor_type: "NPC".to_string(),
            amount: -200,
        });
        assert!(spend.matches_status(&json!({"amount": -200, "mesos": 800})));
        assert!(!spend.matches_status(&json!({"amount": -100, "mesos": 900})));
        assert!(spend.matches_status(&json!({"reason": "NOT_ENOUGH_MESO"})));
        assert!(spend.matches_status(&Value::Null));

        let Inverse::Command(refund) = spend.inverse(None) else {
            panic!("expected a refund");
        };
        assert!(!refund.matches_status(&json!({"amount": -200})));
        assert!(refund.matches_status(&json!({"amount": 200})));

        let transfer = Action::CompartmentTransfer(CompartmentTransferPayload {
            character_id: 42,
            account_id: 7,
            asset_id: 5,
            from: "character".to_string(),
            to: "storage".to_string(),
        });
        let Inverse::Command(back) = transfer.inverse(None) else {
            panic!("expected a reverse transfer");
        };
        let stored = json!({"assetId": 5, "compartment": "storage"});
        assert!(transfer.matches_status(&stored));
        assert!(!back.matches_status(&stored));
    }

    #[test]
    fn wallet_partitions_by_account() {
        let wallet = Action::AdjustCurrency(AdjustCurrencyPayload {
            character_id: 42,
            account_id: 7,
            currency_type: CurrencyType::Points,
            amount: 5,
        });
        assert_eq!(wallet.partition_key(), b"7".to_vec());
        assert_eq!(award_item(1, 1).partition_key(), b"42".to_vec());
    }

    #[test]
    fn currency_type_wire_values() {
        assert_eq!(serde_json::to_value(CurrencyType::Prepaid).unwrap(), 3);
        assert!(serde_json::from_value::<CurrencyType>(json!(9)).is_err());
    }

    #[test]
    fn topic_lists_are_deduplicated() {
        let commands = command_topics();
        assert!(commands.contains(&COMMAND_TOPIC_CHARACTER));
        assert_eq!(
            commands.iter().filter(|t| **t == COMMAND_TOPIC_CHARACTER).count(),
            1
        );
        assert_eq!(status_topics().len(), 9);
    }
}

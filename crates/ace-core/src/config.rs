use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_NUM_PERSONS: u32 = 48;
pub const DEFAULT_NUM_FIRMS: u32 = 12;
pub const DEFAULT_EPISODE_LENGTH: u32 = 40;
pub const DEFAULT_LEARNING_RATE: f32 = 0.001;

pub const LEARNING_RATE_FIELDS: [&str; 9] = [
    "purchaseNetLR",
    "firmPurchaseNetLR",
    "laborSearchNetLR",
    "consumptionNetLR",
    "productionNetLR",
    "offerNetLR",
    "jobOfferNetLR",
    "valueNetLR",
    "firmValueNetLR",
];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown_field: {0}")]
    UnknownField(String),
    #[error("invalid_value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Population sizes and agent distributions. Real-valued fields come in
/// `_mu`/`_sigma` pairs describing a normal draw per agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioParams {
    #[serde(rename = "numPeople")]
    pub num_people: u32,
    #[serde(rename = "numFirms")]
    pub num_firms: u32,

    pub money_mu: f64,
    pub money_sigma: f64,
    pub good1_mu: f64,
    pub good1_sigma: f64,
    pub good2_mu: f64,
    pub good2_sigma: f64,
    pub labor_share_mu: f64,
    pub labor_share_sigma: f64,
    pub good1_share_mu: f64,
    pub good1_share_sigma: f64,
    pub good2_share_mu: f64,
    pub good2_share_sigma: f64,
    pub discount_mu: f64,
    pub discount_sigma: f64,
    pub elasticity_mu: f64,
    pub elasticity_sigma: f64,

    pub firm_money_mu: f64,
    pub firm_money_sigma: f64,
    pub firm_good1_mu: f64,
    pub firm_good1_sigma: f64,
    pub firm_good2_mu: f64,
    pub firm_good2_sigma: f64,
    pub firm_tfp1_mu: f64,
    pub firm_tfp1_sigma: f64,
    pub firm_tfp2_mu: f64,
    pub firm_tfp2_sigma: f64,
    pub firm_labor_share1_mu: f64,
    pub firm_labor_share1_sigma: f64,
    pub firm_good1_share1_mu: f64,
    pub firm_good1_share1_sigma: f64,
    pub firm_good2_share1_mu: f64,
    pub firm_good2_share1_sigma: f64,
    pub firm_labor_share2_mu: f64,
    pub firm_labor_share2_sigma: f64,
    pub firm_good1_share2_mu: f64,
    pub firm_good1_share2_sigma: f64,
    pub firm_good2_share2_mu: f64,
    pub firm_good2_share2_sigma: f64,
    pub firm_elasticity1_mu: f64,
    pub firm_elasticity1_sigma: f64,
    pub firm_elasticity2_mu: f64,
    pub firm_elasticity2_sigma: f64,
}

impl ScenarioParams {
    pub fn new(num_people: u32, num_firms: u32) -> Self {
        Self {
            num_people,
            num_firms,
            money_mu: 10.0,
            money_sigma: 2.0,
            good1_mu: 10.0,
            good1_sigma: 2.0,
            good2_mu: 1.0,
            good2_sigma: 0.2,
            // shares need not sum to 1, the engine normalizes them
            labor_share_mu: 0.4,
            labor_share_sigma: 0.1,
            good1_share_mu: 0.4,
            good1_share_sigma: 0.1,
            good2_share_mu: 0.1,
            good2_share_sigma: 0.02,
            // logit-normal
            discount_mu: 2.0,
            discount_sigma: 1.0,
            elasticity_mu: 10.0,
            elasticity_sigma: 2.5,
            firm_money_mu: 50.0,
            firm_money_sigma: 10.0,
            firm_good1_mu: 10.0,
            firm_good1_sigma: 4.0,
            firm_good2_mu: 30.0,
            firm_good2_sigma: 5.0,
            firm_tfp1_mu: 1.0,
            firm_tfp1_sigma: 0.2,
            firm_tfp2_mu: 1.0,
            firm_tfp2_sigma: 0.2,
            firm_labor_share1_mu: 0.4,
            firm_labor_share1_sigma: 0.05,
            firm_good1_share1_mu: 0.1,
            firm_good1_share1_sigma: 0.02,
            firm_good2_share1_mu: 0.4,
            firm_good2_share1_sigma: 0.02,
            firm_labor_share2_mu: 0.4,
            firm_labor_share2_sigma: 0.05,
            firm_good1_share2_mu: 0.1,
            firm_good1_share2_sigma: 0.02,
            firm_good2_share2_mu: 0.4,
            firm_good2_share2_sigma: 0.05,
            firm_elasticity1_mu: 10.0,
            firm_elasticity1_sigma: 2.5,
            firm_elasticity2_mu: 10.0,
            firm_elasticity2_sigma: 2.5,
        }
    }
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_PERSONS, DEFAULT_NUM_FIRMS)
    }
}

/// Episode cadence, network sizing, one learning rate per trainable
/// network, and the plateau-based learning rate decay controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TrainingParams {
    pub num_episodes: u32,
    pub episode_length: u32,
    pub update_every_n_episodes: u32,
    pub checkpoint_every_n_episodes: u32,

    pub stack_size: u32,
    pub encoding_size: u32,
    pub hidden_size: u32,
    pub n_hidden: u32,
    pub n_hidden_small: u32,

    #[serde(rename = "purchaseNetLR")]
    pub purchase_net_lr: f32,
    #[serde(rename = "firmPurchaseNetLR")]
    pub firm_purchase_net_lr: f32,
    #[serde(rename = "laborSearchNetLR")]
    pub labor_search_net_lr: f32,
    #[serde(rename = "consumptionNetLR")]
    pub consumption_net_lr: f32,
    #[serde(rename = "productionNetLR")]
    pub production_net_lr: f32,
    #[serde(rename = "offerNetLR")]
    pub offer_net_lr: f32,
    #[serde(rename = "jobOfferNetLR")]
    pub job_offer_net_lr: f32,
    #[serde(rename = "valueNetLR")]
    pub value_net_lr: f32,
    #[serde(rename = "firmValueNetLR")]
    pub firm_value_net_lr: f32,

    #[serde(rename = "episodeBatchSizeForLRDecay")]
    pub episode_batch_size_for_lr_decay: u32,
    #[serde(rename = "patienceForLRDecay")]
    pub patience_for_lr_decay: u32,
    #[serde(rename = "multiplierForLRDecay")]
    pub multiplier_for_lr_decay: f32,
}

impl TrainingParams {
    pub fn learning_rates(&self) -> [f32; 9] {
        [
            self.purchase_net_lr,
            self.firm_purchase_net_lr,
            self.labor_search_net_lr,
            self.consumption_net_lr,
            self.production_net_lr,
            self.offer_net_lr,
            self.job_offer_net_lr,
            self.value_net_lr,
            self.firm_value_net_lr,
        ]
    }

    fn learning_rates_mut(&mut self) -> [&mut f32; 9] {
        [
            &mut self.purchase_net_lr,
            &mut self.firm_purchase_net_lr,
            &mut self.labor_search_net_lr,
            &mut self.consumption_net_lr,
            &mut self.production_net_lr,
            &mut self.offer_net_lr,
            &mut self.job_offer_net_lr,
            &mut self.value_net_lr,
            &mut self.firm_value_net_lr,
        ]
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_episodes: 100,
            episode_length: DEFAULT_EPISODE_LENGTH,
            update_every_n_episodes: 1,
            checkpoint_every_n_episodes: 10,
            stack_size: 10,
            encoding_size: 10,
            hidden_size: 100,
            n_hidden: 6,
            n_hidden_small: 3,
            purchase_net_lr: DEFAULT_LEARNING_RATE,
            firm_purchase_net_lr: DEFAULT_LEARNING_RATE,
            labor_search_net_lr: DEFAULT_LEARNING_RATE,
            consumption_net_lr: DEFAULT_LEARNING_RATE,
            production_net_lr: DEFAULT_LEARNING_RATE,
            offer_net_lr: DEFAULT_LEARNING_RATE,
            job_offer_net_lr: DEFAULT_LEARNING_RATE,
            value_net_lr: DEFAULT_LEARNING_RATE,
            firm_value_net_lr: DEFAULT_LEARNING_RATE,
            episode_batch_size_for_lr_decay: 10,
            patience_for_lr_decay: 5,
            multiplier_for_lr_decay: 0.5,
        }
    }
}

/// Scenario plus training parameters: everything that determines a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPair {
    #[serde(rename = "scenarioParams")]
    pub scenario: ScenarioParams,
    #[serde(rename = "trainingParams")]
    pub training: TrainingParams,
}

impl ConfigPair {
    pub fn new(scenario: ScenarioParams, training: TrainingParams) -> Self {
        Self { scenario, training }
    }

    pub fn for_population(num_people: u32, num_firms: u32) -> Self {
        Self::new(
            ScenarioParams::new(num_people, num_firms),
            TrainingParams::default(),
        )
    }

    pub fn with_learning_rate(&self, value: f32) -> Self {
        let mut next = *self;
        for lr in next.training.learning_rates_mut() {
            *lr = value;
        }
        next
    }

    pub fn with_num_episodes(&self, num_episodes: u32) -> Self {
        let mut next = *self;
        next.training.num_episodes = num_episodes;
        next
    }

    pub fn with_episode_length(&self, episode_length: u32) -> Self {
        let mut next = *self;
        next.training.episode_length = episode_length;
        next
    }

    /// Replaces one field addressed as `section.field`, where `section` is
    /// `scenarioParams` (alias `scenario`) or `trainingParams` (alias
    /// `training`) and `field` is the serialized field name.
    pub fn with_field(&self, path: &str, value: Value) -> Result<Self, ConfigError> {
        let (section, field) = path
            .split_once('.')
            .ok_or_else(|| ConfigError::UnknownField(path.to_string()))?;
        let section = match section {
            "scenarioParams" | "scenario" => "scenarioParams",
            "trainingParams" | "training" => "trainingParams",
            _ => return Err(ConfigError::UnknownField(path.to_string())),
        };
        let mut root = serde_json::to_value(self).map_err(|e| ConfigError::InvalidValue {
            field: path.to_string(),
            message: e.to_string(),
        })?;
        let slot = root
            .get_mut(section)
            .and_then(|s| s.get_mut(field))
            .ok_or_else(|| ConfigError::UnknownField(path.to_string()))?;
        *slot = value;
        serde_json::from_value(root).map_err(|e| ConfigError::InvalidValue {
            field: path.to_string(),
            message: e.to_string(),
        })
    }

    pub fn mismatched_fields(&self, other: &ConfigPair) -> Vec<String> {
        let ours = serde_json::to_value(self).unwrap_or_default();
        let theirs = serde_json::to_value(other).unwrap_or_default();
        let mut out = Vec::new();
        for section in ["scenarioParams", "trainingParams"] {
            let (Some(a), Some(b)) = (
                ours.get(section).and_then(Value::as_object),
                theirs.get(section).and_then(Value::as_object),
            ) else {
                out.push(section.to_string());
                continue;
            };
            for (key, value) in a {
                if b.get(key) != Some(value) {
                    out.push(format!("{}.{}", section, key));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_learning_rate_touches_every_lr_field_only() {
        let base = ConfigPair::default();
        let slow = base.with_learning_rate(1e-6);
        assert!(slow.training.learning_rates().iter().all(|lr| *lr == 1e-6));
        assert_eq!(base.training.purchase_net_lr, DEFAULT_LEARNING_RATE);

        let changed = slow.mismatched_fields(&base);
        assert_eq!(changed.len(), LEARNING_RATE_FIELDS.len());
        for name in LEARNING_RATE_FIELDS {
            assert!(
                changed.contains(&format!("trainingParams.{}", name)),
                "missing {} in {:?}",
                name,
                changed
            );
        }
    }

    #[test]
    fn serialized_names_match_engine_fields() {
        let value = serde_json::to_value(ConfigPair::for_population(10, 2)).unwrap();
        assert_eq!(value.pointer("/scenarioParams/numPeople"), Some(&json!(10)));
        assert_eq!(value.pointer("/scenarioParams/numFirms"), Some(&json!(2)));
        assert!(value.pointer("/scenarioParams/firm_elasticity2_sigma").is_some());
        assert_eq!(value.pointer("/trainingParams/numEpisodes"), Some(&json!(100)));
        assert!(value.pointer("/trainingParams/nHiddenSmall").is_some());
        assert!(value.pointer("/trainingParams/firmValueNetLR").is_some());
        assert!(value.pointer("/trainingParams/multiplierForLRDecay").is_some());
        assert_eq!(
            value["scenarioParams"].as_object().unwrap().len(),
            44,
            "scenario field count"
        );
        assert_eq!(
            value["trainingParams"].as_object().unwrap().len(),
            21,
            "training field count"
        );
    }

    #[test]
    fn with_field_is_a_functional_update() {
        let base = ConfigPair::default();
        let edited = base
            .with_field("trainingParams.hiddenSize", json!(200))
            .expect("known field");
        assert_eq!(edited.training.hidden_size, 200);
        assert_eq!(base.training.hidden_size, 100);

        let edited = edited
            .with_field("scenario.money_mu", json!(12.5))
            .expect("alias section");
        assert_eq!(edited.scenario.money_mu, 12.5);
        assert_eq!(
            edited.mismatched_fields(&base),
            vec![
                "scenarioParams.money_mu".to_string(),
                "trainingParams.hiddenSize".to_string()
            ]
        );
    }

    #[test]
    fn with_field_rejects_unknown_names_and_bad_types() {
        let base = ConfigPair::default();
        assert_eq!(
            base.with_field("trainingParams.dropout", json!(0.1)),
            Err(ConfigError::UnknownField("trainingParams.dropout".into()))
        );
        assert!(matches!(
            base.with_field("hiddenSize", json!(1)),
            Err(ConfigError::UnknownField(_))
        ));
        assert!(matches!(
            base.with_field("scenarioParams.numPeople", json!(-3)),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            base.with_field("trainingParams.nHidden", json!(2.5)),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn identical_pairs_have_no_mismatches() {
        let a = ConfigPair::for_population(48, 12).with_num_episodes(5);
        let b = ConfigPair::for_population(48, 12).with_num_episodes(5);
        assert!(a.mismatched_fields(&b).is_empty());
        assert_eq!(a, b);

        let c = b.with_episode_length(41);
        assert_eq!(
            a.mismatched_fields(&c),
            vec!["trainingParams.episodeLength".to_string()]
        );
    }
}

//! Phonetic-context partitioning of a phone inventory.
//!
//! Contextual training fits one GMM per phonetic class instead of a single
//! global mixture. A [`ContextualGmmParams`] buckets the phone inventory into
//! named classes according to a [`ContextScheme`] and carries one trainer
//! configuration per class; the mapper then resolves each frame's phone label
//! to its class with [`ContextualGmmParams::class_index`].

use crate::error::{HablarError, Result};
use crate::trainer::GmmTrainerParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Phonological attribute bits carried by a [`Phone`].
pub mod phonology {
    pub const FRICATIVE: u16 = 1 << 0;
    pub const GLIDE: u16 = 1 << 1;
    pub const LIQUID: u16 = 1 << 2;
    pub const NASAL: u16 = 1 << 3;
    pub const PAUSE: u16 = 1 << 4;
    pub const PLOSIVE: u16 = 1 << 5;
    pub const SONORANT: u16 = 1 << 6;
    pub const SYLLABIC: u16 = 1 << 7;
    pub const VOICED: u16 = 1 << 8;
    pub const VOWEL: u16 = 1 << 9;
}

/// Component-count multipliers applied per context class. Vowels and broad
/// speech classes get larger mixtures to match their feature variability.
const VOWEL_MULTIPLIER: usize = 8;
const CONSONANT_MULTIPLIER: usize = 4;
const SILENCE_MULTIPLIER: usize = 1;
const SPEECH_MULTIPLIER: usize = 8;

/// A phone name plus its phonological attribute bitmask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phone {
    pub name: String,
    pub features: u16,
}

impl Phone {
    /// Creates a phone with the given attribute bits (see [`phonology`]).
    #[must_use]
    pub fn new(name: impl Into<String>, features: u16) -> Self {
        Self {
            name: name.into(),
            features,
        }
    }

    /// Whether the phone carries the given attribute bit(s).
    #[must_use]
    pub fn has(&self, feature: u16) -> bool {
        self.features & feature != 0
    }
}

/// How the phone inventory is partitioned into context classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextScheme {
    /// All phones in one class; equivalent to non-contextual training.
    None,
    /// Pauses in one class, everything else in a "speech" class.
    SilenceSpeech,
    /// Vowels, pauses, and remaining consonants.
    VowelSilenceConsonant,
    /// One class per distinct phonology bitmask.
    PhonologyClass,
    /// Fricatives, glides and liquids, nasals, plosives, vowels, rest.
    FricativeGlideLiquidNasalPlosiveVowelOther,
    /// One class per distinct phone name.
    PhoneIdentity,
}

impl ContextScheme {
    /// Stable numeric tag used by the binary model format.
    pub(crate) fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::SilenceSpeech => 1,
            Self::VowelSilenceConsonant => 2,
            Self::PhonologyClass => 3,
            Self::FricativeGlideLiquidNasalPlosiveVowelOther => 4,
            Self::PhoneIdentity => 5,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::SilenceSpeech),
            2 => Ok(Self::VowelSilenceConsonant),
            3 => Ok(Self::PhonologyClass),
            4 => Ok(Self::FricativeGlideLiquidNasalPlosiveVowelOther),
            5 => Ok(Self::PhoneIdentity),
            other => Err(HablarError::FormatError {
                message: format!("unknown context scheme tag {other}"),
            }),
        }
    }
}

/// One context class: its label, member phone names, and the trainer
/// configuration used for its GMM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextClass {
    pub name: String,
    pub phones: Vec<String>,
    pub trainer_params: GmmTrainerParams,
}

/// A finished partition of the phone inventory: ordered context classes plus
/// an index for per-frame phone lookups.
///
/// Classes own their phones first-match: a phone matching several class
/// predicates belongs to the earliest class in scheme order, and lookups
/// never return a later class.
///
/// # Examples
///
/// ```
/// use hablar::context::{phonology, ContextScheme, ContextualGmmParams, Phone};
/// use hablar::trainer::GmmTrainerParams;
///
/// let inventory = vec![
///     Phone::new("_", phonology::PAUSE),
///     Phone::new("a", phonology::VOWEL | phonology::VOICED),
///     Phone::new("s", phonology::FRICATIVE),
/// ];
/// let params = ContextualGmmParams::from_inventory(
///     ContextScheme::SilenceSpeech,
///     &inventory,
///     &[GmmTrainerParams::default()],
/// )
/// .unwrap();
///
/// assert_eq!(params.n_classes(), 2);
/// assert_eq!(params.class_index("_"), Some(0));
/// assert_eq!(params.class_index("a"), params.class_index("s"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ContextualGmmParams {
    scheme: ContextScheme,
    classes: Vec<ContextClass>,
    index: HashMap<String, usize>,
}

impl ContextualGmmParams {
    /// Partitions `inventory` according to `scheme`.
    ///
    /// `params[i]` configures class `i`; when fewer configurations than
    /// classes are supplied, the remaining classes fall back to `params[0]`.
    /// Each class's requested component count is scaled by its multiplier.
    /// Classes with no member phones are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the inventory or `params` is empty.
    pub fn from_inventory(
        scheme: ContextScheme,
        inventory: &[Phone],
        params: &[GmmTrainerParams],
    ) -> Result<Self> {
        if inventory.is_empty() {
            return Err(HablarError::InvalidHyperparameter {
                param: "inventory".to_string(),
                value: "0 phones".to_string(),
                constraint: "at least one phone".to_string(),
            });
        }
        if params.is_empty() {
            return Err(HablarError::InvalidHyperparameter {
                param: "params".to_string(),
                value: "0 configurations".to_string(),
                constraint: "at least one trainer configuration".to_string(),
            });
        }

        let buckets = match scheme {
            ContextScheme::None => {
                vec![(
                    "all".to_string(),
                    inventory.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
                    1,
                )]
            }
            ContextScheme::SilenceSpeech => bucket_by_predicates(
                inventory,
                &[
                    ("silence", &|p: &Phone| p.has(phonology::PAUSE), SILENCE_MULTIPLIER),
                    ("speech", &|_| true, SPEECH_MULTIPLIER),
                ],
            ),
            ContextScheme::VowelSilenceConsonant => bucket_by_predicates(
                inventory,
                &[
                    ("vowel", &|p: &Phone| p.has(phonology::VOWEL), VOWEL_MULTIPLIER),
                    ("silence", &|p: &Phone| p.has(phonology::PAUSE), SILENCE_MULTIPLIER),
                    ("consonant", &|_| true, CONSONANT_MULTIPLIER),
                ],
            ),
            ContextScheme::FricativeGlideLiquidNasalPlosiveVowelOther => bucket_by_predicates(
                inventory,
                &[
                    ("fricative", &|p: &Phone| p.has(phonology::FRICATIVE), 1),
                    (
                        "glide-liquid",
                        &|p: &Phone| p.has(phonology::GLIDE | phonology::LIQUID),
                        1,
                    ),
                    ("nasal", &|p: &Phone| p.has(phonology::NASAL), 1),
                    ("plosive", &|p: &Phone| p.has(phonology::PLOSIVE), 1),
                    ("vowel", &|p: &Phone| p.has(phonology::VOWEL), VOWEL_MULTIPLIER),
                    ("other", &|_| true, 1),
                ],
            ),
            ContextScheme::PhonologyClass => {
                // One class per distinct bitmask, in first-appearance order.
                let mut order: Vec<u16> = Vec::new();
                let mut members: HashMap<u16, Vec<String>> = HashMap::new();
                for phone in inventory {
                    if !members.contains_key(&phone.features) {
                        order.push(phone.features);
                    }
                    members
                        .entry(phone.features)
                        .or_default()
                        .push(phone.name.clone());
                }
                order
                    .into_iter()
                    .map(|mask| {
                        let phones = members.remove(&mask).unwrap_or_default();
                        (format!("phonology-{mask:#06x}"), phones, 1)
                    })
                    .collect()
            }
            ContextScheme::PhoneIdentity => {
                // One class per distinct phone name, in first-appearance order.
                let mut seen = std::collections::HashSet::new();
                let mut buckets = Vec::new();
                for phone in inventory {
                    if seen.insert(phone.name.as_str()) {
                        buckets.push((phone.name.clone(), vec![phone.name.clone()], 1));
                    }
                }
                buckets
            }
        };

        let mut classes = Vec::new();
        for (i, (name, phones, multiplier)) in buckets.into_iter().enumerate() {
            if phones.is_empty() {
                continue;
            }
            let mut trainer_params = params.get(i).unwrap_or(&params[0]).clone();
            trainer_params.total_components *= multiplier;
            classes.push(ContextClass {
                name,
                phones,
                trainer_params,
            });
        }

        Ok(Self::from_classes(scheme, classes))
    }

    /// Assembles a partition from already-built classes, rebuilding the
    /// lookup index. Used when reloading a persisted model.
    pub(crate) fn from_classes(scheme: ContextScheme, classes: Vec<ContextClass>) -> Self {
        let mut index = HashMap::new();
        for (i, class) in classes.iter().enumerate() {
            for phone in &class.phones {
                // First-match ownership: keep the earliest class.
                index.entry(phone.clone()).or_insert(i);
            }
        }
        Self {
            scheme,
            classes,
            index,
        }
    }

    /// Zero-based index of the class owning `phone`, or `None` when the
    /// phone belongs to no class. Called per frame at inference time.
    #[must_use]
    pub fn class_index(&self, phone: &str) -> Option<usize> {
        self.index.get(phone).copied()
    }

    /// The partition scheme that produced these classes.
    #[must_use]
    pub fn scheme(&self) -> ContextScheme {
        self.scheme
    }

    /// The context classes, in scheme order.
    #[must_use]
    pub fn classes(&self) -> &[ContextClass] {
        &self.classes
    }

    /// Number of non-empty context classes.
    #[must_use]
    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }
}

type Predicate<'a> = &'a dyn Fn(&Phone) -> bool;

/// Buckets phones into the first class whose predicate matches. The last
/// predicate is expected to be catch-all, so every phone lands somewhere.
fn bucket_by_predicates(
    inventory: &[Phone],
    groups: &[(&str, Predicate<'_>, usize)],
) -> Vec<(String, Vec<String>, usize)> {
    let mut buckets: Vec<(String, Vec<String>, usize)> = groups
        .iter()
        .map(|(name, _, multiplier)| ((*name).to_string(), Vec::new(), *multiplier))
        .collect();
    for phone in inventory {
        for (i, (_, predicate, _)) in groups.iter().enumerate() {
            if predicate(phone) {
                buckets[i].1.push(phone.name.clone());
                break;
            }
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> Vec<GmmTrainerParams> {
        vec![GmmTrainerParams::default()]
    }

    fn small_inventory() -> Vec<Phone> {
        vec![
            Phone::new("_", phonology::PAUSE),
            Phone::new("a", phonology::VOWEL | phonology::VOICED | phonology::SYLLABIC),
            Phone::new("i", phonology::VOWEL | phonology::VOICED | phonology::SYLLABIC),
            Phone::new("s", phonology::FRICATIVE),
            Phone::new("z", phonology::FRICATIVE | phonology::VOICED),
            Phone::new("m", phonology::NASAL | phonology::VOICED | phonology::SONORANT),
            Phone::new("l", phonology::LIQUID | phonology::VOICED),
            Phone::new("w", phonology::GLIDE | phonology::VOICED),
            Phone::new("t", phonology::PLOSIVE),
            Phone::new("d", phonology::PLOSIVE | phonology::VOICED),
        ]
    }

    #[test]
    fn test_silence_speech_two_classes() {
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::SilenceSpeech,
            &small_inventory(),
            &default_params(),
        )
        .unwrap();

        assert_eq!(params.n_classes(), 2);
        assert_eq!(params.classes()[0].name, "silence");
        assert_eq!(params.classes()[0].phones, vec!["_".to_string()]);
        assert_eq!(params.classes()[1].phones.len(), 9);
    }

    #[test]
    fn test_silence_speech_multipliers() {
        let base = GmmTrainerParams {
            total_components: 3,
            ..GmmTrainerParams::default()
        };
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::SilenceSpeech,
            &small_inventory(),
            &[base],
        )
        .unwrap();

        assert_eq!(params.classes()[0].trainer_params.total_components, 3);
        assert_eq!(params.classes()[1].trainer_params.total_components, 24);
    }

    #[test]
    fn test_vowel_silence_consonant() {
        let base = GmmTrainerParams {
            total_components: 2,
            ..GmmTrainerParams::default()
        };
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::VowelSilenceConsonant,
            &small_inventory(),
            &[base],
        )
        .unwrap();

        assert_eq!(params.n_classes(), 3);
        assert_eq!(params.classes()[0].name, "vowel");
        assert_eq!(params.classes()[0].phones, vec!["a".to_string(), "i".to_string()]);
        assert_eq!(params.classes()[0].trainer_params.total_components, 16);
        assert_eq!(params.classes()[1].trainer_params.total_components, 2);
        assert_eq!(params.classes()[2].trainer_params.total_components, 8);
        assert_eq!(params.classes()[2].phones.len(), 7);
    }

    #[test]
    fn test_five_class_scheme_first_match() {
        // A phone that is both fricative and vowel goes to the fricative
        // class, the earliest matching one.
        let inventory = vec![
            Phone::new("x", phonology::FRICATIVE | phonology::VOWEL),
            Phone::new("a", phonology::VOWEL),
            Phone::new("_", phonology::PAUSE),
        ];
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::FricativeGlideLiquidNasalPlosiveVowelOther,
            &inventory,
            &default_params(),
        )
        .unwrap();

        let fricative = &params.classes()[0];
        assert_eq!(fricative.name, "fricative");
        assert_eq!(fricative.phones, vec!["x".to_string()]);
        assert_eq!(params.class_index("x"), Some(0));
        assert_eq!(params.classes()[1].name, "vowel");
        assert_eq!(params.classes()[2].name, "other");
    }

    #[test]
    fn test_empty_classes_dropped() {
        // No vowels: the vowel class disappears entirely.
        let inventory = vec![
            Phone::new("_", phonology::PAUSE),
            Phone::new("t", phonology::PLOSIVE),
        ];
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::VowelSilenceConsonant,
            &inventory,
            &default_params(),
        )
        .unwrap();

        assert_eq!(params.n_classes(), 2);
        assert_eq!(params.classes()[0].name, "silence");
        assert_eq!(params.classes()[1].name, "consonant");
    }

    #[test]
    fn test_phonology_class_groups_masks() {
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::PhonologyClass,
            &small_inventory(),
            &default_params(),
        )
        .unwrap();

        // "a" and "i" share a bitmask; "s" and "z" do not.
        assert_eq!(params.class_index("a"), params.class_index("i"));
        assert_ne!(params.class_index("s"), params.class_index("z"));
    }

    #[test]
    fn test_phone_identity_deduplicates() {
        let inventory = vec![
            Phone::new("a", phonology::VOWEL),
            Phone::new("t", phonology::PLOSIVE),
            Phone::new("a", phonology::VOWEL),
        ];
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::PhoneIdentity,
            &inventory,
            &default_params(),
        )
        .unwrap();

        assert_eq!(params.n_classes(), 2);
        assert_eq!(params.classes()[0].name, "a");
        assert_eq!(params.classes()[1].name, "t");
    }

    #[test]
    fn test_none_scheme_single_class() {
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::None,
            &small_inventory(),
            &default_params(),
        )
        .unwrap();

        assert_eq!(params.n_classes(), 1);
        assert_eq!(params.classes()[0].phones.len(), 10);
        assert_eq!(params.class_index("m"), Some(0));
    }

    #[test]
    fn test_per_class_params_with_fallback() {
        let base = GmmTrainerParams::default();
        let silence_params = GmmTrainerParams {
            total_components: 1,
            ..base.clone()
        };
        // Only the first class gets dedicated params; the rest fall back to
        // params[0].
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::SilenceSpeech,
            &small_inventory(),
            &[silence_params],
        )
        .unwrap();

        assert_eq!(params.classes()[0].trainer_params.total_components, 1);
        assert_eq!(params.classes()[1].trainer_params.total_components, 8);
    }

    #[test]
    fn test_unknown_phone_not_found() {
        let params = ContextualGmmParams::from_inventory(
            ContextScheme::SilenceSpeech,
            &small_inventory(),
            &default_params(),
        )
        .unwrap();
        assert_eq!(params.class_index("q"), None);
    }

    #[test]
    fn test_empty_inventory_rejected() {
        let result = ContextualGmmParams::from_inventory(
            ContextScheme::None,
            &[],
            &default_params(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_params_rejected() {
        let result = ContextualGmmParams::from_inventory(
            ContextScheme::None,
            &small_inventory(),
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_scheme_codes_round_trip() {
        for scheme in [
            ContextScheme::None,
            ContextScheme::SilenceSpeech,
            ContextScheme::VowelSilenceConsonant,
            ContextScheme::PhonologyClass,
            ContextScheme::FricativeGlideLiquidNasalPlosiveVowelOther,
            ContextScheme::PhoneIdentity,
        ] {
            assert_eq!(ContextScheme::from_code(scheme.code()).unwrap(), scheme);
        }
        assert!(ContextScheme::from_code(99).is_err());
    }
}

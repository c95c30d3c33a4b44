use crate::config::{BreedLabels, Thresholds};
use crate::error::AppError;
use crate::models::classify_types::{
    BreedPrediction, ClassificationResult, Prediction, Species, NOT_APPLICABLE, NOT_SPECIFIED,
};
use crate::services::classifier::inference::Classifier;
use image::RgbImage;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};

static DOG_KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "dog", "puppy", "hound", "terrier", "retriever", "shepherd", "bulldog", "poodle",
        "beagle", "collie", "spaniel", "husky", "malamute", "corgi", "dachshund", "chihuahua",
        "pug", "boxer", "doberman", "rottweiler", "labrador", "golden", "german", "shih",
        "maltese", "pomeranian", "schnauzer", "mastiff", "dane", "setter", "pointer",
        "weimaraner", "vizsla", "basenji", "akita", "samoyed", "chow", "dalmatian", "greyhound",
        "whippet", "borzoi", "afghan", "saluki", "newfoundland", "saint bernard", "bernese",
        "great pyrenees", "leonberger", "kuvasz",
    ])
});

static CAT_KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "cat", "kitten", "feline", "tabby", "persian", "siamese", "maine coon", "ragdoll",
        "bengal", "sphynx", "abyssinian", "scottish fold", "british", "russian blue",
        "norwegian", "birman", "burmese", "oriental", "himalayan", "egyptian mau", "tonkinese",
        "turkish", "manx", "somali", "balinese",
    ])
});

// Checked in order; the first key contained in the formatted name wins.
const SPECIAL_CASES: &[(&str, &str)] = &[
    ("Shih Tzu", "Shih Tzu"),
    ("Lhasa", "Lhasa Apso"),
    ("Pembroke", "Pembroke Welsh Corgi"),
    ("Cardigan", "Cardigan Welsh Corgi"),
    ("Boston Bull", "Boston Terrier"),
    ("Toy Poodle", "Toy Poodle"),
    ("Miniature Poodle", "Miniature Poodle"),
    ("Standard Poodle", "Standard Poodle"),
];

/// The loaded classifiers one `classify` call may use. Only the breed model
/// for the detected species has to be present.
pub struct ModelSet<'a> {
    pub species: &'a dyn Classifier,
    pub dog_breed: Option<&'a dyn Classifier>,
    pub cat_breed: Option<&'a dyn Classifier>,
}

#[derive(Clone, Debug)]
pub struct ClassificationPipeline {
    thresholds: Thresholds,
    labels: BreedLabels,
}

impl ClassificationPipeline {
    pub fn new(thresholds: Thresholds, labels: BreedLabels) -> Self {
        Self { thresholds, labels }
    }

    /// Never fails: inference errors come back as an error-carrying result.
    pub fn classify(&self, image: &RgbImage, models: &ModelSet<'_>) -> ClassificationResult {
        let outcome = self.species_of(image, models.species).and_then(|(species, confidence)| {
            let breed_model = match species {
                Species::Dog => models.dog_breed,
                Species::Cat => models.cat_breed,
                Species::Other => None,
            };
            self.breed_result(image, species, confidence, breed_model)
        });
        outcome.unwrap_or_else(|e| {
            warn!("Classification error: {}", e);
            ClassificationResult::from_error(e.to_string())
        })
    }

    /// Runs the general classifier and votes on the species.
    pub fn species_of(
        &self,
        image: &RgbImage,
        classifier: &dyn Classifier,
    ) -> Result<(Species, f32), AppError> {
        let labels = classifier.predict(image, self.thresholds.species_top_k)?;
        let (species, confidence) = self.detect_species(&labels);
        debug!("species {:?} ({:.2})", species, confidence);
        Ok((species, confidence))
    }

    /// Breed step for an already detected species. `Other` needs no model.
    pub fn breed_result(
        &self,
        image: &RgbImage,
        species: Species,
        species_confidence: f32,
        breed_model: Option<&dyn Classifier>,
    ) -> Result<ClassificationResult, AppError> {
        let mixed_label = match species {
            Species::Other => {
                return Ok(ClassificationResult {
                    species: Some(Species::Other),
                    species_confidence,
                    breed: NOT_APPLICABLE.to_string(),
                    breed_confidence: 0.0,
                    is_mixed_breed: false,
                    ..ClassificationResult::default()
                });
            }
            Species::Dog => self.labels.mixed_dog.as_str(),
            Species::Cat => self.labels.mixed_cat.as_str(),
        };
        let breed_model = breed_model.ok_or_else(|| {
            AppError::Classification(format!("No breed model loaded for {:?}", species))
        })?;

        let predictions = breed_model.predict(image, self.thresholds.alternatives + 1)?;
        let Some((top, rest)) = predictions.split_first() else {
            return Err(AppError::Classification(
                "Breed model produced no predictions".to_string(),
            ));
        };

        let breed = format_breed_name(&top.class_name);
        let confidence = clamp_unit(top.confidence);
        let mut alternatives: Vec<BreedPrediction> = rest
            .iter()
            .map(|p| BreedPrediction {
                breed: format_breed_name(&p.class_name),
                confidence: clamp_unit(p.confidence),
            })
            .collect();

        let is_mixed = confidence < self.thresholds.min_breed_confidence;
        let (breed, breed_confidence) = if is_mixed {
            if breed != NOT_SPECIFIED {
                alternatives.insert(0, BreedPrediction { breed, confidence });
            }
            (mixed_label.to_string(), 0.0)
        } else {
            (breed, confidence)
        };
        alternatives.truncate(self.thresholds.alternatives);

        Ok(ClassificationResult {
            species: Some(species),
            species_confidence,
            breed,
            breed_confidence,
            alternative_breeds: alternatives,
            is_mixed_breed: is_mixed,
            raw_breed: top.class_name.clone(),
            error: None,
        })
    }

    /// Keyword vote over the general classifier's top labels.
    pub fn detect_species(&self, labels: &[Prediction]) -> (Species, f32) {
        let mut dog_score = 0.0f32;
        let mut cat_score = 0.0f32;

        for p in labels.iter().take(self.thresholds.species_top_k) {
            let label = p.class_name.to_lowercase();
            if DOG_KEYWORDS.iter().any(|k| label.contains(k)) {
                dog_score += p.confidence;
            } else if CAT_KEYWORDS.iter().any(|k| label.contains(k)) {
                cat_score += p.confidence;
            }
        }

        let best = dog_score.max(cat_score);
        let pick = if dog_score >= cat_score {
            (Species::Dog, dog_score)
        } else {
            (Species::Cat, cat_score)
        };

        if best > self.thresholds.min_species_confidence
            || best > self.thresholds.fallback_species_confidence
        {
            (pick.0, clamp_unit(pick.1))
        } else {
            (Species::Other, clamp_unit(1.0 - dog_score - cat_score))
        }
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// `"golden_retriever"` -> `"Golden Retriever"`, with a few canonical names.
pub fn format_breed_name(raw: &str) -> String {
    let formatted = raw
        .replace(['_', '-'], " ")
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");

    if formatted.is_empty() {
        return NOT_SPECIFIED.to_string();
    }

    let lower = formatted.to_lowercase();
    SPECIAL_CASES
        .iter()
        .find(|(key, _)| lower.contains(&key.to_lowercase()))
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(formatted)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::classifier::acquirer::testing::FixedClassifier;

    struct Failing;

    impl Classifier for Failing {
        fn predict(&self, _: &RgbImage, _: usize) -> Result<Vec<Prediction>, AppError> {
            Err(AppError::Classification("session crashed".to_string()))
        }
    }

    fn p(label: &str, confidence: f32) -> Prediction {
        Prediction {
            class_name: label.to_string(),
            confidence,
        }
    }

    fn pipeline() -> ClassificationPipeline {
        ClassificationPipeline::new(Thresholds::default(), BreedLabels::default())
    }

    fn image() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn summed_dog_labels_pick_dog() {
        let (species, confidence) = pipeline().detect_species(&[
            p("golden_retriever", 0.55),
            p("labrador", 0.20),
            p("tabby_cat", 0.05),
        ]);
        assert_eq!(species, Species::Dog);
        assert!((confidence - 0.75).abs() < 1e-5);
    }

    #[test]
    fn weak_signal_still_picks_higher_species() {
        let (species, confidence) =
            pipeline().detect_species(&[p("Egyptian cat", 0.35), p("beagle", 0.10)]);
        assert_eq!(species, Species::Cat);
        assert!((confidence - 0.35).abs() < 1e-5);
    }

    #[test]
    fn ties_favor_dog() {
        let (species, _) = pipeline().detect_species(&[p("pug", 0.4), p("persian", 0.4)]);
        assert_eq!(species, Species::Dog);
    }

    #[test]
    fn label_counts_toward_one_set_only() {
        // "cat" and "boxer" both occur; only the dog set gets the score.
        let (species, confidence) = pipeline().detect_species(&[p("boxer cat toy", 0.7)]);
        assert_eq!(species, Species::Dog);
        assert!((confidence - 0.7).abs() < 1e-5);
    }

    #[test]
    fn no_animal_is_other() {
        let (species, confidence) =
            pipeline().detect_species(&[p("teapot", 0.8), p("tabby", 0.1)]);
        assert_eq!(species, Species::Other);
        assert!((confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn other_short_circuits_breed() {
        let species = FixedClassifier(vec![p("sports car", 0.9)]);
        let breed = Failing;
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&breed),
                cat_breed: Some(&breed),
            },
        );
        assert_eq!(result.species, Some(Species::Other));
        assert_eq!(result.breed, NOT_APPLICABLE);
        assert_eq!(result.breed_confidence, 0.0);
        assert!(!result.is_mixed_breed);
        assert!(result.error.is_none());
    }

    #[test]
    fn confident_breed_is_reported() {
        let species = FixedClassifier(vec![p("golden retriever", 0.9)]);
        let dogs = FixedClassifier(vec![
            p("golden_retriever", 0.80),
            p("labrador_retriever", 0.10),
            p("kuvasz", 0.05),
            p("lhasa", 0.03),
            p("pug", 0.01),
        ]);
        let cats = Failing;
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&dogs),
                cat_breed: Some(&cats),
            },
        );
        assert_eq!(result.species, Some(Species::Dog));
        assert_eq!(result.breed, "Golden Retriever");
        assert_eq!(result.raw_breed, "golden_retriever");
        assert!((result.breed_confidence - 0.80).abs() < 1e-5);
        assert!(!result.is_mixed_breed);
        let alts: Vec<_> = result.alternative_breeds.iter().map(|b| b.breed.as_str()).collect();
        assert_eq!(alts, vec!["Labrador Retriever", "Kuvasz", "Lhasa Apso"]);
    }

    #[test]
    fn low_confidence_becomes_mixed_breed() {
        let species = FixedClassifier(vec![p("beagle", 0.9)]);
        let dogs = FixedClassifier(vec![
            p("beagle", 0.40),
            p("basset", 0.30),
            p("bluetick", 0.20),
            p("redbone", 0.10),
        ]);
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&dogs),
                cat_breed: None,
            },
        );
        assert!(result.is_mixed_breed);
        assert_eq!(result.breed, "Aspin (Mixed Breed)");
        assert_eq!(result.breed_confidence, 0.0);
        assert_eq!(result.alternative_breeds.len(), 3);
        assert_eq!(
            result.alternative_breeds[0],
            BreedPrediction {
                breed: "Beagle".to_string(),
                confidence: 0.40
            }
        );
    }

    #[test]
    fn mixed_cat_uses_puspin() {
        let species = FixedClassifier(vec![p("tabby, tabby cat", 0.8)]);
        let cats = FixedClassifier(vec![p("siamese", 0.2)]);
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: None,
                cat_breed: Some(&cats),
            },
        );
        assert_eq!(result.species, Some(Species::Cat));
        assert_eq!(result.breed, "Puspin (Mixed Breed)");
        assert_eq!(result.alternative_breeds[0].breed, "Siamese");
    }

    #[test]
    fn inference_failure_is_data() {
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &Failing,
                dog_breed: Some(&Failing),
                cat_breed: Some(&Failing),
            },
        );
        assert!(result.error.unwrap().contains("session crashed"));
        assert!(result.species.is_none());
    }

    #[test]
    fn empty_breed_output_is_an_error() {
        let species = FixedClassifier(vec![p("pug", 0.9)]);
        let empty = FixedClassifier(vec![]);
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&empty),
                cat_breed: Some(&empty),
            },
        );
        assert!(result.error.is_some());
    }

    #[test]
    fn over_unity_scores_are_clamped() {
        let (species, confidence) = pipeline().detect_species(&[
            p("golden_retriever", 0.7),
            p("labrador", 0.4),
            p("pug", 0.2),
        ]);
        assert_eq!(species, Species::Dog);
        assert_eq!(confidence, 1.0);

        let species = FixedClassifier(vec![p("beagle", 1.3)]);
        let dogs = FixedClassifier(vec![p("beagle", 1.7), p("basset", -0.2)]);
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&dogs),
                cat_breed: None,
            },
        );
        assert_eq!(result.species_confidence, 1.0);
        assert_eq!(result.breed_confidence, 1.0);
        assert_eq!(result.alternative_breeds[0].confidence, 0.0);
    }

    #[test]
    fn unnamed_top_label_is_not_suggested() {
        let species = FixedClassifier(vec![p("pug", 0.9)]);
        let dogs = FixedClassifier(vec![p("", 0.3), p("pug", 0.2)]);
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&dogs),
                cat_breed: None,
            },
        );
        assert!(result.is_mixed_breed);
        assert_eq!(result.raw_breed, "");
        let alts: Vec<_> = result.alternative_breeds.iter().map(|b| b.breed.as_str()).collect();
        assert_eq!(alts, vec!["Pug"]);
    }

    #[test]
    fn dog_needs_only_the_dog_model() {
        let species = FixedClassifier(vec![p("beagle", 0.9)]);
        let dogs = FixedClassifier(vec![p("beagle", 0.9)]);
        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: Some(&dogs),
                cat_breed: None,
            },
        );
        assert!(result.error.is_none());
        assert_eq!(result.breed, "Beagle");

        let result = pipeline().classify(
            &image(),
            &ModelSet {
                species: &species,
                dog_breed: None,
                cat_breed: Some(&dogs),
            },
        );
        assert!(result.error.unwrap().contains("No breed model"));
    }

    #[test]
    fn breed_names_are_formatted() {
        assert_eq!(format_breed_name("german_shepherd"), "German Shepherd");
        assert_eq!(format_breed_name("shih-tzu"), "Shih Tzu");
        assert_eq!(format_breed_name("Lhasa"), "Lhasa Apso");
        assert_eq!(format_breed_name("boston_bull"), "Boston Terrier");
        assert_eq!(format_breed_name("MAINE_COON"), "Maine Coon");
        assert_eq!(format_breed_name(""), NOT_SPECIFIED);
    }
}

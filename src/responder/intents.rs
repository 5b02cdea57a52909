//! Keyword-matching intent responder.
//!
//! Intents are read from a JSON file:
//!
//! ```json
//! {"intents": [
//!     {"tag": "greeting", "patterns": ["Hi", "Hello there"], "responses": ["Hello!"]}
//! ]}
//! ```
//!
//! Training reduces each intent's patterns to a keyword set. The trained
//! model is saved as `<model_dir>/<name>.json` and loaded on the next start
//! unless a retrain is forced. A request is matched to the intent whose
//! keywords cover the largest share of its tokens; replies rotate through the
//! intent's responses.

use super::{Responder, ResponderError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Reply when no intent matches.
pub const FALLBACK_REPLY: &str = "I don't understand!";

/// Minimum share of request tokens an intent must cover.
pub const MATCH_THRESHOLD: f64 = 0.25;

/// One intent as written in the intents file.
#[derive(Debug, Clone, Deserialize)]
pub struct Intent {
    pub tag: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub responses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IntentsFile {
    intents: Vec<Intent>,
}

/// A trained intent: its keywords and the replies it rotates through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClass {
    pub tag: String,
    pub keywords: BTreeSet<String>,
    pub responses: Vec<String>,
}

/// Trained keyword model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentModel {
    pub name: String,
    /// Intents file the model was trained from.
    pub source: PathBuf,
    /// RFC 3339 training timestamp.
    pub trained_at: String,
    pub classes: Vec<IntentClass>,
}

impl IntentModel {
    /// Train a model from an intents file.
    pub fn train(name: &str, source: &Path) -> Result<Self, ModelError> {
        let contents =
            fs::read_to_string(source).map_err(|e| ModelError::Read(source.to_path_buf(), e))?;
        let file: IntentsFile = serde_json::from_str(&contents)
            .map_err(|e| ModelError::Parse(source.to_path_buf(), e))?;
        Self::from_intents(name, source, file.intents)
    }

    /// Train a model from already parsed intents.
    pub fn from_intents(
        name: &str,
        source: &Path,
        intents: Vec<Intent>,
    ) -> Result<Self, ModelError> {
        let classes: Vec<IntentClass> = intents
            .into_iter()
            .map(|intent| IntentClass {
                keywords: intent.patterns.iter().flat_map(|p| tokenize(p)).collect(),
                tag: intent.tag,
                responses: intent.responses,
            })
            .filter(|class| !class.keywords.is_empty())
            .collect();

        if classes.is_empty() {
            return Err(ModelError::Empty(source.to_path_buf()));
        }

        Ok(Self {
            name: name.to_string(),
            source: source.to_path_buf(),
            trained_at: chrono::Utc::now().to_rfc3339(),
            classes,
        })
    }

    /// Path of the saved model named `name` inside `dir`.
    pub fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.json", name))
    }

    /// Load a saved model.
    pub fn load(dir: &Path, name: &str) -> Result<Self, ModelError> {
        let path = Self::path(dir, name);
        let contents = fs::read_to_string(&path).map_err(|e| ModelError::Read(path.clone(), e))?;
        serde_json::from_str(&contents).map_err(|e| ModelError::Parse(path, e))
    }

    /// Save the model, returning where it was written.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        let path = Self::path(dir, &self.name);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ModelError::Parse(path.clone(), e))?;
        fs::write(&path, json).map_err(|e| ModelError::Write(path.clone(), e))?;
        Ok(path)
    }

    /// Best matching class and its score, if any class scores above zero.
    pub fn classify(&self, text: &str) -> Option<(usize, f64)> {
        let tokens: BTreeSet<String> = tokenize(text).collect();
        if tokens.is_empty() {
            return None;
        }

        let mut best: Option<(usize, f64)> = None;
        for (idx, class) in self.classes.iter().enumerate() {
            let hits = tokens.iter().filter(|t| class.keywords.contains(*t)).count();
            let score = hits as f64 / tokens.len() as f64;
            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        best
    }
}

/// Lower-cased alphanumeric words of two or more characters.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 2)
        .map(str::to_lowercase)
}

/// Responder backed by an `IntentModel`.
pub struct IntentResponder {
    model: IntentModel,
    /// Next response index per class.
    cursors: Vec<AtomicUsize>,
}

impl IntentResponder {
    pub fn new(model: IntentModel) -> Self {
        let cursors = model.classes.iter().map(|_| AtomicUsize::new(0)).collect();
        Self { model, cursors }
    }

    /// Load the saved model, or train and save one.
    ///
    /// With `retrain` set the saved model is ignored. A saved model that
    /// fails to load is replaced by a freshly trained one.
    pub fn open(
        intents: &Path,
        model_dir: &Path,
        name: &str,
        retrain: bool,
    ) -> Result<Self, ModelError> {
        if !retrain {
            match IntentModel::load(model_dir, name) {
                Ok(model) => {
                    info!(
                        model = %name,
                        trained_at = %model.trained_at,
                        intents = model.classes.len(),
                        "Loaded intent model"
                    );
                    return Ok(Self::new(model));
                }
                Err(e) => warn!(error = %e, "Failed to load intent model, retraining"),
            }
        }

        let model = IntentModel::train(name, intents)?;
        let path = model.save(model_dir)?;
        info!(
            model = %name,
            path = %path.display(),
            intents = model.classes.len(),
            "Trained intent model"
        );
        Ok(Self::new(model))
    }

    pub fn model(&self) -> &IntentModel {
        &self.model
    }
}

impl Responder for IntentResponder {
    fn handle(&self, request: &str) -> Result<String, ResponderError> {
        if request.trim().is_empty() {
            return Err(ResponderError::Failed("empty request".to_string()));
        }

        let Some((idx, score)) = self
            .model
            .classify(request)
            .filter(|&(_, score)| score >= MATCH_THRESHOLD)
        else {
            debug!("No intent matched");
            return Ok(FALLBACK_REPLY.to_string());
        };

        let class = &self.model.classes[idx];
        debug!(tag = %class.tag, score, "Intent matched");
        if class.responses.is_empty() {
            return Ok(FALLBACK_REPLY.to_string());
        }
        let n = self.cursors[idx].fetch_add(1, Ordering::Relaxed);
        Ok(class.responses[n % class.responses.len()].clone())
    }
}

/// Intent model errors.
#[derive(Debug)]
pub enum ModelError {
    Read(PathBuf, std::io::Error),
    Write(PathBuf, std::io::Error),
    Parse(PathBuf, serde_json::Error),
    Empty(PathBuf),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Read(path, e) => write!(f, "Failed to read '{}': {}", path.display(), e),
            ModelError::Write(path, e) => {
                write!(f, "Failed to write '{}': {}", path.display(), e)
            }
            ModelError::Parse(path, e) => {
                write!(f, "Failed to parse '{}': {}", path.display(), e)
            }
            ModelError::Empty(path) => {
                write!(f, "No usable intents in '{}'", path.display())
            }
        }
    }
}

impl std::error::Error for ModelError {}

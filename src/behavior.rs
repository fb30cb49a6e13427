//! The weighted probabilistic model of visitor behavior.
//!
//! Every probabilistic branch taken while simulating a visitor, from "page view or
//! interaction?" down to "which share button was clicked?", is drawn from a
//! [`WeightedTable`]. The tables are built from [`BehaviorWeights`], which can be
//! loaded from a JSON file with `--weights-file` so the complete probability tree
//! can be tuned without recompiling.
//!
//! The defaults mirror the traffic observed on a large news publisher: 95% of
//! tracked actions are page views, most of them articles.
//!
//! ```json
//! {
//!   "page_view_probability": 0.9,
//!   "page_categories": [
//!     { "value": "article", "weight": 0.6 },
//!     { "value": "category", "weight": 0.3 },
//!     { "value": "search", "weight": 0.1 }
//!   ]
//! }
//! ```
//!
//! Omitted fields keep their defaults.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::{Display, EnumIter};

use crate::TrackloadError;

const LOWERCASE_ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const HEX: &[u8] = b"0123456789abcdef";

/// One `{value, weight}` entry of a weighted table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Weighted<T> {
    pub value: T,
    pub weight: f64,
}
impl<T> Weighted<T> {
    pub fn new(value: T, weight: f64) -> Self {
        Weighted { value, weight }
    }
}

/// A table of values, each chosen with a probability proportional to its weight.
///
/// Weights don't need to sum to 1, they are normalized. Negative, non-finite, or
/// all-zero weights are rejected when the table is built.
///
/// # Example
/// ```rust
/// use rand::rngs::StdRng;
/// use rand::SeedableRng;
/// use trackload::behavior::{Weighted, WeightedTable};
///
/// let table = WeightedTable::new(
///     "video",
///     vec![Weighted::new("Play", 7.0), Weighted::new("Complete", 3.0)],
/// )
/// .unwrap();
/// assert!((table.probability(0) - 0.7).abs() < f64::EPSILON);
///
/// let mut rng = StdRng::seed_from_u64(42);
/// let action = table.choose(&mut rng);
/// assert!(*action == "Play" || *action == "Complete");
/// ```
#[derive(Clone, Debug)]
pub struct WeightedTable<T> {
    values: Vec<T>,
    weights: Vec<f64>,
    total: f64,
    index: WeightedIndex<f64>,
}
impl<T> WeightedTable<T> {
    /// Build a table, `name` identifies the table in errors.
    pub fn new(name: &str, entries: Vec<Weighted<T>>) -> Result<Self, TrackloadError> {
        if let Some(invalid) = entries
            .iter()
            .find(|entry| !entry.weight.is_finite() || entry.weight < 0.0)
        {
            return Err(TrackloadError::InvalidWeight {
                table: name.to_string(),
                detail: format!("weight {} must be a finite number >= 0", invalid.weight),
            });
        }

        let (values, weights): (Vec<T>, Vec<f64>) = entries
            .into_iter()
            .map(|entry| (entry.value, entry.weight))
            .unzip();
        let index =
            WeightedIndex::new(weights.iter().copied()).map_err(|e| TrackloadError::InvalidWeight {
                table: name.to_string(),
                detail: format!("{} (weights: {:?})", e, weights),
            })?;
        let total = weights.iter().sum();

        Ok(WeightedTable {
            values,
            weights,
            total,
            index,
        })
    }

    /// Draw one value.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        &self.values[self.index.sample(rng)]
    }

    /// The normalized probability of the value at `index`.
    pub fn probability(&self, index: usize) -> f64 {
        self.weights[index] / self.total
    }
}

/// The kind of page a simulated visitor views.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PageCategory {
    /// A single story, by far the most common page.
    Article,
    /// A section front listing stories of one category.
    Category,
    /// A page of search results.
    Search,
}

/// The family of an interaction event.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InteractionFamily {
    Scroll,
    Video,
    Advertising,
    Social,
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoAction {
    Play,
    Complete,
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdAction {
    #[strum(serialize = "Ad Impression")]
    Impression,
    #[strum(serialize = "Ad Click")]
    Click,
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SocialAction {
    Share,
    /// The conversion branch, tracked with a goal id.
    NewsletterSignup,
    Comment,
}

/// The configurable weights of every probabilistic branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorWeights {
    /// Probability that an action is a page view rather than an interaction event.
    pub page_view_probability: f64,
    pub page_categories: Vec<Weighted<PageCategory>>,
    pub interaction_families: Vec<Weighted<InteractionFamily>>,
    /// Scroll depth percentages.
    pub scroll_depths: Vec<Weighted<u8>>,
    pub video_actions: Vec<Weighted<VideoAction>>,
    pub ad_actions: Vec<Weighted<AdAction>>,
    pub social_actions: Vec<Weighted<SocialAction>>,
    pub share_platforms: Vec<Weighted<String>>,
    /// Site sections, used for article and category pages.
    pub sections: Vec<Weighted<String>>,
    pub authors: Vec<Weighted<String>>,
    /// Browsers, one is chosen per session.
    pub user_agents: Vec<Weighted<String>>,
    /// Probability that a visitor identity is a logged-in user, tracked with `uid`.
    pub user_id_probability: f64,
    /// Goal id attached to newsletter signups.
    pub newsletter_goal_id: u32,
}
impl Default for BehaviorWeights {
    fn default() -> Self {
        let equal = |values: &[&str]| -> Vec<Weighted<String>> {
            values
                .iter()
                .map(|value| Weighted::new(value.to_string(), 1.0))
                .collect()
        };

        BehaviorWeights {
            page_view_probability: 0.95,
            page_categories: vec![
                Weighted::new(PageCategory::Article, 0.70),
                Weighted::new(PageCategory::Category, 0.20),
                Weighted::new(PageCategory::Search, 0.10),
            ],
            interaction_families: vec![
                Weighted::new(InteractionFamily::Scroll, 0.4),
                Weighted::new(InteractionFamily::Video, 0.3),
                Weighted::new(InteractionFamily::Advertising, 0.2),
                Weighted::new(InteractionFamily::Social, 0.1),
            ],
            scroll_depths: vec![Weighted::new(50, 0.5), Weighted::new(100, 0.5)],
            video_actions: vec![
                Weighted::new(VideoAction::Play, 0.7),
                Weighted::new(VideoAction::Complete, 0.3),
            ],
            ad_actions: vec![
                Weighted::new(AdAction::Impression, 0.9),
                Weighted::new(AdAction::Click, 0.1),
            ],
            social_actions: vec![
                Weighted::new(SocialAction::Share, 0.4),
                Weighted::new(SocialAction::NewsletterSignup, 0.4),
                Weighted::new(SocialAction::Comment, 0.2),
            ],
            share_platforms: equal(&["X", "Facebook"]),
            sections: equal(&[
                "News",
                "Sports",
                "Entertainment",
                "Technology",
                "Politics",
                "Business",
                "Lifestyle",
                "Travel",
                "Health",
                "Science",
            ]),
            authors: equal(&[
                "A. Writer",
                "B. Journalist",
                "C. Editor",
                "D. Contributor",
                "E. Reporter",
            ]),
            user_agents: vec![
                Weighted::new("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36".to_string(), 0.35),
                Weighted::new("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15".to_string(), 0.10),
                Weighted::new("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0".to_string(), 0.10),
                Weighted::new("Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Mobile Safari/537.36".to_string(), 0.30),
                Weighted::new("Mozilla/5.0 (iPhone; CPU iPhone OS 17_5_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1".to_string(), 0.15),
            ],
            user_id_probability: 0.07,
            newsletter_goal_id: 1,
        }
    }
}
impl BehaviorWeights {
    /// Load weights from a JSON file, fields missing from the file keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TrackloadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| TrackloadError::InvalidOption {
            option: "`configuration.weights_file`".to_string(),
            value: path.display().to_string(),
            detail: format!("failed to parse behavior weights: {}", e),
        })
    }
}

/// The compiled behavior model: one [`WeightedTable`] per probabilistic branch.
#[derive(Clone, Debug)]
pub struct BehaviorModel {
    pub(crate) action_kinds: WeightedTable<ActionKind>,
    pub(crate) page_categories: WeightedTable<PageCategory>,
    pub(crate) interaction_families: WeightedTable<InteractionFamily>,
    pub(crate) scroll_depths: WeightedTable<u8>,
    pub(crate) video_actions: WeightedTable<VideoAction>,
    pub(crate) ad_actions: WeightedTable<AdAction>,
    pub(crate) social_actions: WeightedTable<SocialAction>,
    pub(crate) share_platforms: WeightedTable<String>,
    pub(crate) sections: WeightedTable<String>,
    pub(crate) authors: WeightedTable<String>,
    pub(crate) user_agents: WeightedTable<String>,
    pub(crate) user_id_probability: f64,
    pub(crate) newsletter_goal_id: u32,
}

/// The top level branch: is the next action a page view or an interaction?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ActionKind {
    PageView,
    Interaction,
}

impl BehaviorModel {
    /// Validate the weights and build all tables.
    pub fn new(weights: &BehaviorWeights) -> Result<Self, TrackloadError> {
        let probability = |name: &str, value: f64| -> Result<f64, TrackloadError> {
            if value.is_finite() && (0.0..=1.0).contains(&value) {
                Ok(value)
            } else {
                Err(TrackloadError::InvalidWeight {
                    table: name.to_string(),
                    detail: format!("probability {} must be between 0 and 1", value),
                })
            }
        };
        let page_view_probability =
            probability("page_view_probability", weights.page_view_probability)?;

        Ok(BehaviorModel {
            action_kinds: WeightedTable::new(
                "page_view_probability",
                vec![
                    Weighted::new(ActionKind::PageView, page_view_probability),
                    Weighted::new(ActionKind::Interaction, 1.0 - page_view_probability),
                ],
            )?,
            page_categories: WeightedTable::new(
                "page_categories",
                weights.page_categories.clone(),
            )?,
            interaction_families: WeightedTable::new(
                "interaction_families",
                weights.interaction_families.clone(),
            )?,
            scroll_depths: WeightedTable::new("scroll_depths", weights.scroll_depths.clone())?,
            video_actions: WeightedTable::new("video_actions", weights.video_actions.clone())?,
            ad_actions: WeightedTable::new("ad_actions", weights.ad_actions.clone())?,
            social_actions: WeightedTable::new("social_actions", weights.social_actions.clone())?,
            share_platforms: WeightedTable::new(
                "share_platforms",
                weights.share_platforms.clone(),
            )?,
            sections: WeightedTable::new("sections", weights.sections.clone())?,
            authors: WeightedTable::new("authors", weights.authors.clone())?,
            user_agents: WeightedTable::new("user_agents", weights.user_agents.clone())?,
            user_id_probability: probability("user_id_probability", weights.user_id_probability)?,
            newsletter_goal_id: weights.newsletter_goal_id,
        })
    }

    /// Choose the browser of a new session.
    pub fn user_agent<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.user_agents.choose(rng).clone()
    }
}

/// A random string of lowercase letters and digits.
pub fn random_alphanumeric<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    random_from(rng, LOWERCASE_ALPHANUMERIC, length)
}

/// A random string of lowercase hexadecimal digits, as used by visitor ids.
pub fn random_hex<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    random_from(rng, HEX, length)
}

fn random_from<R: Rng + ?Sized>(rng: &mut R, charset: &[u8], length: usize) -> String {
    (0..length)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn weighted_table() {
        let table = WeightedTable::new(
            "test",
            vec![
                Weighted::new('a', 1.0),
                Weighted::new('b', 3.0),
                Weighted::new('c', 0.0),
            ],
        )
        .unwrap();
        assert!((table.probability(0) - 0.25).abs() < f64::EPSILON);
        assert!((table.probability(1) - 0.75).abs() < f64::EPSILON);
        assert!(table.probability(2).abs() < f64::EPSILON);

        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0usize; 3];
        for _ in 0..40_000 {
            match table.choose(&mut rng) {
                'a' => counts[0] += 1,
                'b' => counts[1] += 1,
                _ => counts[2] += 1,
            }
        }
        // A zero weight is never chosen.
        assert_eq!(counts[2], 0);
        let observed = counts[1] as f64 / 40_000.0;
        assert!((observed - 0.75).abs() < 0.01, "observed {}", observed);
    }

    #[test]
    fn invalid_tables() {
        assert!(WeightedTable::<u8>::new("empty", vec![]).is_err());
        assert!(WeightedTable::new("zero", vec![Weighted::new(1, 0.0)]).is_err());
        assert!(WeightedTable::new("negative", vec![Weighted::new(1, -0.5)]).is_err());
        assert!(WeightedTable::new("nan", vec![Weighted::new(1, f64::NAN)]).is_err());
        assert!(WeightedTable::new("inf", vec![Weighted::new(1, f64::INFINITY)]).is_err());
    }

    #[test]
    fn invalid_weights() {
        let mut weights = BehaviorWeights::default();
        assert!(BehaviorModel::new(&weights).is_ok());

        weights.page_view_probability = 1.5;
        assert!(BehaviorModel::new(&weights).is_err());

        let mut weights = BehaviorWeights::default();
        weights.user_id_probability = -0.1;
        assert!(BehaviorModel::new(&weights).is_err());

        let mut weights = BehaviorWeights::default();
        weights.user_agents.clear();
        assert!(BehaviorModel::new(&weights).is_err());

        // Only page views, the interaction branch has weight 0.
        let mut weights = BehaviorWeights::default();
        weights.page_view_probability = 1.0;
        assert!(BehaviorModel::new(&weights).is_ok());
    }

    #[test]
    fn partial_weights_json() {
        let weights: BehaviorWeights = serde_json::from_str(
            r#"{
                "page_view_probability": 0.5,
                "page_categories": [
                    { "value": "article", "weight": 1 },
                    { "value": "search", "weight": 1 }
                ]
            }"#,
        )
        .unwrap();
        assert!((weights.page_view_probability - 0.5).abs() < f64::EPSILON);
        assert_eq!(weights.page_categories.len(), 2);
        assert_eq!(weights.page_categories[1].value, PageCategory::Search);
        // Omitted fields keep their defaults.
        assert_eq!(weights.authors, BehaviorWeights::default().authors);
        assert_eq!(weights.newsletter_goal_id, 1);
    }

    #[test]
    fn random_strings() {
        let mut rng = StdRng::seed_from_u64(1);
        let hex = random_hex(&mut rng, 16);
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let alphanumeric = random_alphanumeric(&mut rng, 12);
        assert_eq!(alphanumeric.len(), 12);
        assert!(alphanumeric
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn tag_names() {
        assert_eq!(PageCategory::Article.to_string(), "article");
        assert_eq!(InteractionFamily::Advertising.to_string(), "advertising");
        assert_eq!(SocialAction::NewsletterSignup.to_string(), "newsletter_signup");
        assert_eq!(AdAction::Click.to_string(), "Ad Click");
        assert_eq!(VideoAction::Complete.to_string(), "Complete");
    }
}

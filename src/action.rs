//! Generating tracked actions and encoding them as tracking requests.
//!
//! The [`ActionGenerator`] draws the next [`ActionEvent`] from the [`BehaviorModel`],
//! then merges it with the visitor's identity and session into a [`TrackingRequest`]
//! carrying the parameters of the Matomo tracking API. All randomness comes from the
//! random number generator passed in, so a seeded generator produces the exact same
//! traffic.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::behavior::{
    random_alphanumeric, random_hex, ActionKind, AdAction, BehaviorModel, InteractionFamily,
    PageCategory, SocialAction, VideoAction,
};
use crate::session::{Session, VisitorIdentity};

/// Where the simulated pages live, and what every tracking request reports about the site.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SiteSettings {
    /// The `idsite` of the tracked website.
    pub site_id: usize,
    /// Scheme and host of the simulated page urls.
    pub page_host: String,
    pub locale: String,
    pub resolution: String,
    /// Sent as `token_auth` when set.
    pub auth_token: Option<String>,
}
impl Default for SiteSettings {
    fn default() -> Self {
        SiteSettings {
            site_id: 1,
            page_host: "https://connect.detik.com".to_string(),
            locale: "en-US".to_string(),
            resolution: "1920x1080".to_string(),
            auth_token: None,
        }
    }
}

/// One tracked action of a visitor.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionEvent {
    PageView {
        category: PageCategory,
        url: String,
        title: String,
        /// Custom dimensions, `dimension1` (section) and `dimension2` (author) on articles.
        dimensions: BTreeMap<String, String>,
    },
    Interaction {
        family: InteractionFamily,
        /// Sent as `e_c`.
        category: String,
        /// Sent as `e_a`.
        action: String,
        /// Sent as `e_n`.
        label: String,
        /// Sent as `idgoal`, for conversions.
        goal_id: Option<u32>,
        tag: &'static str,
    },
}
impl ActionEvent {
    /// The metric tag requests for this action are counted under.
    pub fn tag(&self) -> &'static str {
        match self {
            ActionEvent::PageView { category, .. } => match category {
                PageCategory::Article => "page_view_article",
                PageCategory::Category => "page_view_category",
                PageCategory::Search => "page_view_search",
            },
            ActionEvent::Interaction { tag, .. } => *tag,
        }
    }

    /// The url of a page view.
    pub fn page_url(&self) -> Option<&str> {
        match self {
            ActionEvent::PageView { url, .. } => Some(url),
            ActionEvent::Interaction { .. } => None,
        }
    }
}

/// A fully encoded request to the tracker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackingRequest {
    /// Tracking API parameters, sorted by name.
    pub params: BTreeMap<String, String>,
    /// Sent as the `User-Agent` header, and as `ua`.
    pub user_agent: String,
    /// The metric tag of the action.
    pub tag: &'static str,
}
impl TrackingRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Draws actions from the behavior model and encodes them as tracking requests.
#[derive(Clone, Debug)]
pub struct ActionGenerator {
    model: BehaviorModel,
    site: SiteSettings,
}
impl ActionGenerator {
    pub fn new(model: BehaviorModel, mut site: SiteSettings) -> Self {
        site.page_host = site.page_host.trim_end_matches('/').to_string();
        ActionGenerator { model, site }
    }

    pub fn model(&self) -> &BehaviorModel {
        &self.model
    }

    /// Draw the next action.
    pub fn next_action<R: Rng + ?Sized>(&self, rng: &mut R) -> ActionEvent {
        match self.model.action_kinds.choose(rng) {
            ActionKind::PageView => self.page_view(rng),
            ActionKind::Interaction => self.interaction(rng),
        }
    }

    fn page_view<R: Rng + ?Sized>(&self, rng: &mut R) -> ActionEvent {
        let host = &self.site.page_host;
        let category = *self.model.page_categories.choose(rng);
        let mut dimensions = BTreeMap::new();
        let (url, title) = match category {
            PageCategory::Article => {
                let section = self.model.sections.choose(rng);
                let author = self.model.authors.choose(rng);
                dimensions.insert("dimension1".to_string(), section.clone());
                dimensions.insert("dimension2".to_string(), author.clone());
                (
                    format!(
                        "{}/{}/{}-article-{}.html",
                        host,
                        section.to_lowercase(),
                        random_alphanumeric(rng, 12),
                        random_alphanumeric(rng, 7)
                    ),
                    format!("Article: {} - {}", section, random_alphanumeric(rng, 9)),
                )
            }
            PageCategory::Category => {
                let section = self.model.sections.choose(rng);
                (
                    format!("{}/category/{}/", host, section.to_lowercase()),
                    format!("Category: {}", section),
                )
            }
            PageCategory::Search => {
                let term = random_alphanumeric(rng, 8);
                (
                    format!("{}/search?q={}", host, term),
                    format!("Search Results for \"{}\"", term),
                )
            }
        };

        ActionEvent::PageView {
            category,
            url,
            title,
            dimensions,
        }
    }

    fn interaction<R: Rng + ?Sized>(&self, rng: &mut R) -> ActionEvent {
        let family = *self.model.interaction_families.choose(rng);
        let mut goal_id = None;
        let (category, action, label, tag) = match family {
            InteractionFamily::Scroll => {
                let depth = self.model.scroll_depths.choose(rng);
                (
                    "Content Engagement".to_string(),
                    "Scroll Depth".to_string(),
                    format!("{}% Scrolled", depth),
                    "event_scroll",
                )
            }
            InteractionFamily::Video => {
                let action: VideoAction = *self.model.video_actions.choose(rng);
                (
                    "Video".to_string(),
                    action.to_string(),
                    format!("Video: VID-{}", random_alphanumeric(rng, 7)),
                    "event_video",
                )
            }
            InteractionFamily::Advertising => {
                let action: AdAction = *self.model.ad_actions.choose(rng);
                (
                    "Advertising".to_string(),
                    action.to_string(),
                    format!("Ad: AD-{}", random_alphanumeric(rng, 5)),
                    "event_ad_interaction",
                )
            }
            InteractionFamily::Social => match self.model.social_actions.choose(rng) {
                SocialAction::Share => (
                    "Social Sharing".to_string(),
                    "Share Click".to_string(),
                    format!("Shared on {}", self.model.share_platforms.choose(rng)),
                    "event_social_share",
                ),
                SocialAction::NewsletterSignup => {
                    goal_id = Some(self.model.newsletter_goal_id);
                    (
                        "Engagement".to_string(),
                        "Newsletter Signup".to_string(),
                        "Successful Signup".to_string(),
                        "event_newsletter_signup",
                    )
                }
                SocialAction::Comment => (
                    "Engagement".to_string(),
                    "Comment Posted".to_string(),
                    format!("Article: {}", random_alphanumeric(rng, 8)),
                    "event_comment_post",
                ),
            },
        };

        ActionEvent::Interaction {
            family,
            category,
            action,
            label,
            goal_id,
            tag,
        }
    }

    /// Encode an action of `identity` during `session` as a tracking request.
    ///
    /// The base parameters describe the visitor, the browser and the current page. The
    /// action's own fields are merged on top, overriding only the keys they define.
    /// Interactions don't define `url`, so they are tracked on the session's current page.
    pub fn build_request<R: Rng + ?Sized>(
        &self,
        identity: &VisitorIdentity,
        session: &Session,
        event: &ActionEvent,
        rng: &mut R,
        timestamp: DateTime<Utc>,
    ) -> TrackingRequest {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            params.insert(key.to_string(), value);
        };

        set("idsite", self.site.site_id.to_string());
        set("rec", "1".to_string());
        set("apiv", "1".to_string());
        set("rand", rng.random_range(0..100_000_000_000u64).to_string());
        set("_id", identity.visitor_id.clone());
        set("cid", random_hex(rng, 16));
        set("pv_id", random_hex(rng, 6));
        set("ua", session.user_agent.clone());
        set("lang", self.site.locale.clone());
        set("res", self.site.resolution.clone());
        set("cookie", "1".to_string());
        set("send_image", "0".to_string());
        set("gt_ms", rng.random_range(0..1_000u32).to_string());
        set("cdt", timestamp.format("%Y-%m-%d %H:%M:%S").to_string());
        if let Some(url) = session.current_url.as_ref() {
            set("url", url.clone());
        }
        if let Some(user_id) = identity.user_id.as_ref() {
            set("uid", user_id.clone());
        }
        if let Some(auth_token) = self.site.auth_token.as_ref() {
            set("token_auth", auth_token.clone());
        }

        match event {
            ActionEvent::PageView {
                url,
                title,
                dimensions,
                ..
            } => {
                set("url", url.clone());
                set("action_name", title.clone());
                for (key, value) in dimensions {
                    set(key.as_str(), value.clone());
                }
            }
            ActionEvent::Interaction {
                category,
                action,
                label,
                goal_id,
                ..
            } => {
                set("e_c", category.clone());
                set("e_a", action.clone());
                set("e_n", label.clone());
                if let Some(goal_id) = goal_id {
                    set("idgoal", goal_id.to_string());
                }
            }
        }

        TrackingRequest {
            params,
            user_agent: session.user_agent.clone(),
            tag: event.tag(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::behavior::{BehaviorWeights, Weighted};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::time::Instant;

    fn generator(weights: &BehaviorWeights) -> ActionGenerator {
        ActionGenerator::new(
            BehaviorModel::new(weights).unwrap(),
            SiteSettings {
                site_id: 7,
                page_host: "https://news.example.com/".to_string(),
                ..Default::default()
            },
        )
    }

    fn session(current_url: Option<&str>) -> Session {
        Session {
            number: 1,
            started_at: Instant::now(),
            page_view_count: 1,
            planned_length: 5,
            user_agent: "TestBrowser/1.0".to_string(),
            current_url: current_url.map(str::to_string),
        }
    }

    fn identity() -> VisitorIdentity {
        VisitorIdentity {
            visitor_id: "0123456789abcdef".to_string(),
            user_id: None,
        }
    }

    #[test]
    fn page_views() {
        let mut weights = BehaviorWeights::default();
        weights.page_view_probability = 1.0;
        let generator = generator(&weights);
        let mut rng = StdRng::seed_from_u64(9);

        for _ in 0..1_000 {
            let event = generator.next_action(&mut rng);
            let ActionEvent::PageView {
                category,
                url,
                title,
                dimensions,
            } = event
            else {
                panic!("expected only page views");
            };
            assert!(url.starts_with("https://news.example.com/"));
            match category {
                PageCategory::Article => {
                    assert!(url.contains("-article-") && url.ends_with(".html"));
                    assert!(title.starts_with("Article: "));
                    let section = &dimensions["dimension1"];
                    assert!(url.contains(&format!("/{}/", section.to_lowercase())));
                    assert!(dimensions.contains_key("dimension2"));
                }
                PageCategory::Category => {
                    assert!(url.contains("/category/") && url.ends_with('/'));
                    assert!(title.starts_with("Category: "));
                    assert!(dimensions.is_empty());
                }
                PageCategory::Search => {
                    assert!(url.contains("/search?q="));
                    assert!(title.starts_with("Search Results for \""));
                    assert!(dimensions.is_empty());
                }
            }
        }
    }

    #[test]
    fn interactions() {
        let mut weights = BehaviorWeights::default();
        weights.page_view_probability = 0.0;
        weights.social_actions = vec![Weighted::new(SocialAction::NewsletterSignup, 1.0)];
        weights.newsletter_goal_id = 4;
        let generator = generator(&weights);
        let mut rng = StdRng::seed_from_u64(9);

        for _ in 0..1_000 {
            let event = generator.next_action(&mut rng);
            assert!(event.page_url().is_none());
            let ActionEvent::Interaction {
                family,
                goal_id,
                tag,
                label,
                ..
            } = event
            else {
                panic!("expected only interactions");
            };
            match family {
                InteractionFamily::Scroll => {
                    assert_eq!(tag, "event_scroll");
                    assert!(label == "50% Scrolled" || label == "100% Scrolled");
                }
                InteractionFamily::Video => assert!(label.starts_with("Video: VID-")),
                InteractionFamily::Advertising => assert!(label.starts_with("Ad: AD-")),
                InteractionFamily::Social => {
                    assert_eq!(tag, "event_newsletter_signup");
                    assert_eq!(goal_id, Some(4));
                    continue;
                }
            }
            assert!(goal_id.is_none());
        }
    }

    #[test]
    fn page_view_request() {
        let generator = generator(&BehaviorWeights::default());
        let mut rng = StdRng::seed_from_u64(1);
        let event = ActionEvent::PageView {
            category: PageCategory::Category,
            url: "https://news.example.com/category/sports/".to_string(),
            title: "Category: Sports".to_string(),
            dimensions: BTreeMap::new(),
        };
        let timestamp = DateTime::parse_from_rfc3339("2024-05-01T12:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let request = generator.build_request(
            &identity(),
            &session(Some("https://news.example.com/")),
            &event,
            &mut rng,
            timestamp,
        );

        assert_eq!(request.tag, "page_view_category");
        assert_eq!(request.user_agent, "TestBrowser/1.0");
        assert_eq!(request.param("idsite"), Some("7"));
        assert_eq!(request.param("rec"), Some("1"));
        assert_eq!(request.param("apiv"), Some("1"));
        assert_eq!(request.param("_id"), Some("0123456789abcdef"));
        assert_eq!(request.param("ua"), Some("TestBrowser/1.0"));
        assert_eq!(request.param("lang"), Some("en-US"));
        assert_eq!(request.param("res"), Some("1920x1080"));
        assert_eq!(request.param("cdt"), Some("2024-05-01 12:30:05"));
        // The page view's url replaces the previous page.
        assert_eq!(
            request.param("url"),
            Some("https://news.example.com/category/sports/")
        );
        assert_eq!(request.param("action_name"), Some("Category: Sports"));
        assert_eq!(request.param("pv_id").map(str::len), Some(6));
        assert!(request.param("gt_ms").unwrap().parse::<u32>().unwrap() < 1_000);
        assert!(request.param("uid").is_none());
        assert!(request.param("token_auth").is_none());
        assert!(request.param("e_c").is_none());
    }

    #[test]
    fn interaction_keeps_current_page() {
        let generator = ActionGenerator::new(
            BehaviorModel::new(&BehaviorWeights::default()).unwrap(),
            SiteSettings {
                auth_token: Some("secret".to_string()),
                ..Default::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(1);
        let identity = VisitorIdentity {
            visitor_id: "fedcba9876543210".to_string(),
            user_id: Some("user_abcdefghijkl".to_string()),
        };
        let event = ActionEvent::Interaction {
            family: InteractionFamily::Social,
            category: "Engagement".to_string(),
            action: "Newsletter Signup".to_string(),
            label: "Successful Signup".to_string(),
            goal_id: Some(1),
            tag: "event_newsletter_signup",
        };
        let request = generator.build_request(
            &identity,
            &session(Some("https://connect.detik.com/news/a-article-b.html")),
            &event,
            &mut rng,
            Utc::now(),
        );

        assert_eq!(
            request.param("url"),
            Some("https://connect.detik.com/news/a-article-b.html")
        );
        assert_eq!(request.param("e_c"), Some("Engagement"));
        assert_eq!(request.param("e_a"), Some("Newsletter Signup"));
        assert_eq!(request.param("e_n"), Some("Successful Signup"));
        assert_eq!(request.param("idgoal"), Some("1"));
        assert_eq!(request.param("uid"), Some("user_abcdefghijkl"));
        assert_eq!(request.param("token_auth"), Some("secret"));
        assert!(request.param("action_name").is_none());
        assert_eq!(request.param("_id"), Some("fedcba9876543210"));

        // Without a current page, an interaction has no url.
        let request =
            generator.build_request(&identity, &session(None), &event, &mut rng, Utc::now());
        assert!(request.param("url").is_none());
        assert!(request.param("idsite").is_some());
    }

    #[test]
    fn reproducible() {
        let generator = generator(&BehaviorWeights::default());
        let timestamp = Utc::now();
        let run = |seed: u64| -> Vec<TrackingRequest> {
            let mut rng = StdRng::seed_from_u64(seed);
            let session = session(Some("https://news.example.com/"));
            (0..200)
                .map(|_| {
                    let event = generator.next_action(&mut rng);
                    generator.build_request(&identity(), &session, &event, &mut rng, timestamp)
                })
                .collect()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }
}

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use crate::action::ActionGenerator;
use crate::dispatcher::Dispatcher;
use crate::metrics::{MetricTags, MetricsAggregator};
use crate::pacer::{pause, Pacer, Pause};
use crate::session::{IdentityPolicy, SessionSettings, SessionState};

/// Commands the scheduler sends to running virtual users.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum UserCommand {
    /// Complete the current session, then exit.
    Finish,
    /// Exit at the next opportunity, abandoning the current session.
    Exit,
}

/// Everything virtual users share.
pub(crate) struct UserContext {
    pub(crate) generator: ActionGenerator,
    pub(crate) pacer: Pacer,
    pub(crate) identity_policy: IdentityPolicy,
    pub(crate) session_settings: SessionSettings,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) metrics: Arc<MetricsAggregator>,
    /// A successful response body must contain one of these, if any are set.
    pub(crate) expect_body: Vec<String>,
}

/// One simulated visitor, owning its session state and random number generator.
pub(crate) struct VirtualUser {
    pub(crate) number: usize,
    context: Arc<UserContext>,
    state: SessionState,
    rng: StdRng,
}
impl VirtualUser {
    pub(crate) fn new(number: usize, context: Arc<UserContext>) -> Self {
        let rng = StdRng::from_rng(&mut rand::rng());
        VirtualUser::with_rng(number, context, rng)
    }

    pub(crate) fn with_rng(number: usize, context: Arc<UserContext>, rng: StdRng) -> Self {
        let state = SessionState::new(context.identity_policy, context.session_settings);
        VirtualUser {
            number,
            context,
            state,
            rng,
        }
    }

    // True between sessions, including before the first one.
    fn at_session_boundary(&self) -> bool {
        self.state
            .session()
            .map_or(true, |session| session.is_complete())
    }
}

pub(crate) async fn user_main(mut user: VirtualUser, receiver: flume::Receiver<UserCommand>) {
    info!("launching user {}...", user.number);
    let context = user.context.clone();
    let mut finishing = false;

    'simulate: loop {
        if received_exit(&receiver, &mut finishing) {
            break;
        }
        if finishing && user.at_session_boundary() {
            break;
        }

        if user
            .state
            .ensure_session(context.generator.model(), &mut user.rng)
        {
            debug!(
                "user {}: starting session {}",
                user.number,
                user.state.sessions_started()
            );
        }

        let event = context.generator.next_action(&mut user.rng);
        let request = match user.state.current() {
            Some((identity, session)) => context.generator.build_request(
                identity,
                session,
                &event,
                &mut user.rng,
                Utc::now(),
            ),
            None => break,
        };
        if let Some(url) = event.page_url() {
            user.state.record_page_view(url);
        }

        // An exit abandons a request in flight, a finish only takes effect at the end of
        // the session.
        let outcome = tokio::select! {
            biased;
            _ = wait_for_exit(&receiver, &mut finishing) => break 'simulate,
            outcome = context.dispatcher.send(&request) => outcome,
        };

        match outcome {
            Ok(response) => {
                let success = response.is_success();
                let check_passed = success
                    && (context.expect_body.is_empty()
                        || context
                            .expect_body
                            .iter()
                            .any(|marker| response.body.contains(marker.as_str())));
                debug!(
                    "user {}: {} returned {} in {}ms",
                    user.number,
                    request.tag,
                    response.status_code,
                    response.latency.as_millis()
                );
                context.metrics.record_request(
                    success,
                    response.latency,
                    &MetricTags {
                        tag: request.tag,
                        status_code: Some(response.status_code),
                        check_passed,
                    },
                );
            }
            Err(error) => {
                debug!("user {}: {} failed: {}", user.number, request.tag, error);
                context.metrics.record_request(
                    false,
                    error.latency(),
                    &MetricTags {
                        tag: request.tag,
                        status_code: None,
                        check_passed: false,
                    },
                );
            }
        }

        let completed = user
            .state
            .session()
            .filter(|session| session.is_complete())
            .map(|session| session.page_view_count);
        match completed {
            Some(page_views) => {
                context.metrics.record_session_depth(page_views);
                if finishing {
                    break;
                }
                let delay = context.pacer.inter_session_delay(&mut user.rng);
                debug!("user {}: session complete, pausing {:?}", user.number, delay);
                // Any command ends the user between sessions.
                if pause(delay, next_command(&receiver)).await == Pause::Cancelled {
                    break;
                }
            }
            None => {
                let delay = context.pacer.inter_action_delay(&mut user.rng);
                if pause(delay, wait_for_exit(&receiver, &mut finishing)).await
                    == Pause::Cancelled
                {
                    break;
                }
            }
        }
    }

    info!(
        "exiting user {} after {} sessions...",
        user.number,
        user.state.sessions_started()
    );
}

// Determine if the scheduler has sent UserCommand::Exit, remembering any Finish.
fn received_exit(receiver: &flume::Receiver<UserCommand>, finishing: &mut bool) -> bool {
    while let Ok(command) = receiver.try_recv() {
        match command {
            UserCommand::Exit => return true,
            UserCommand::Finish => *finishing = true,
        }
    }
    receiver.is_disconnected() && receiver.is_empty()
}

// Resolves once UserCommand::Exit is received, remembering any Finish on the way.
async fn wait_for_exit(receiver: &flume::Receiver<UserCommand>, finishing: &mut bool) {
    loop {
        match receiver.recv_async().await {
            Ok(UserCommand::Finish) => *finishing = true,
            // A disconnected channel means the scheduler is gone.
            Ok(UserCommand::Exit) | Err(_) => return,
        }
    }
}

// Resolves on any command.
async fn next_command(receiver: &flume::Receiver<UserCommand>) {
    let _ = receiver.recv_async().await;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::{SiteSettings, TrackingRequest};
    use crate::behavior::{BehaviorModel, BehaviorWeights};
    use crate::dispatcher::{DispatchError, DispatchResponse};
    use crate::pacer::PacingProfile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    struct StaticDispatcher {
        status_code: u16,
        body: &'static str,
        latency: Duration,
        requests: AtomicUsize,
        /// When each request was sent.
        sent_at: Mutex<Vec<Instant>>,
    }
    impl StaticDispatcher {
        fn new(status_code: u16) -> Self {
            StaticDispatcher {
                status_code,
                body: "Matomo Analytics",
                latency: Duration::from_millis(10),
                requests: AtomicUsize::new(0),
                sent_at: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Dispatcher for StaticDispatcher {
        async fn send(
            &self,
            _request: &TrackingRequest,
        ) -> Result<DispatchResponse, DispatchError> {
            self.sent_at.lock().unwrap().push(Instant::now());
            tokio::time::sleep(self.latency).await;
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(DispatchResponse {
                status_code: self.status_code,
                latency: self.latency,
                body: self.body.to_string(),
            })
        }
    }

    fn user_context(
        status_code: u16,
        expect_body: Vec<String>,
    ) -> (Arc<UserContext>, Arc<StaticDispatcher>) {
        let dispatcher = Arc::new(StaticDispatcher::new(status_code));
        let profile = PacingProfile::Aggressive;
        let context = Arc::new(UserContext {
            generator: ActionGenerator::new(
                BehaviorModel::new(&BehaviorWeights::default()).unwrap(),
                SiteSettings::default(),
            ),
            pacer: Pacer::new(profile.think_time(), profile.session_gap()),
            identity_policy: profile.identity_policy(),
            session_settings: profile.session_length(),
            dispatcher: dispatcher.clone(),
            metrics: Arc::new(MetricsAggregator::new()),
            expect_body,
        });
        (context, dispatcher)
    }

    fn spawn_user(
        context: &Arc<UserContext>,
        seed: u64,
    ) -> (
        flume::Sender<UserCommand>,
        tokio::task::JoinHandle<()>,
    ) {
        let (sender, receiver) = flume::unbounded();
        let user = VirtualUser::with_rng(1, context.clone(), StdRng::seed_from_u64(seed));
        (sender, tokio::spawn(user_main(user, receiver)))
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_sessions() {
        let (context, dispatcher) = user_context(500, vec![]);
        let (sender, handle) = spawn_user(&context, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        sender.send(UserCommand::Finish).unwrap();
        handle.await.unwrap();

        let summary = context.metrics.snapshot();
        assert!(summary.http_reqs > 100);
        assert_eq!(summary.http_reqs, dispatcher.requests.load(Ordering::SeqCst));
        assert_eq!(summary.http_req_failed.value(), Some(1.0));
        assert_eq!(summary.successful_tracking_requests, 0);
        assert_eq!(summary.status_codes[&500], summary.http_reqs);
        // Every session ran to its planned length, the user finished at a session end.
        assert!(summary.sessions > 10);
        assert!(summary.session_depth_page_views.min >= 4);
        assert!(summary.session_depth_page_views.max <= 6);
        let page_views: usize = summary
            .requests_by_tag
            .iter()
            .filter(|(tag, _)| tag.starts_with("page_view"))
            .map(|(_, counts)| counts.requests)
            .sum();
        assert_eq!(page_views, summary.session_depth_page_views.total);
    }

    #[tokio::test(start_paused = true)]
    async fn longer_pause_between_sessions() {
        let dispatcher = Arc::new(StaticDispatcher::new(200));
        let mut weights = BehaviorWeights::default();
        // Only page views, so every session is exactly two requests.
        weights.page_view_probability = 1.0;
        let context = Arc::new(UserContext {
            generator: ActionGenerator::new(
                BehaviorModel::new(&weights).unwrap(),
                SiteSettings::default(),
            ),
            pacer: Pacer::new(
                (Duration::from_millis(10), Duration::from_millis(10)),
                (Duration::from_secs(10), Duration::from_secs(10)),
            ),
            identity_policy: IdentityPolicy::Persistent,
            session_settings: SessionSettings {
                min_length: 2,
                max_length: 2,
            },
            dispatcher: dispatcher.clone(),
            metrics: Arc::new(MetricsAggregator::new()),
            expect_body: vec![],
        });
        let (sender, handle) = spawn_user(&context, 5);

        tokio::time::sleep(Duration::from_secs(45)).await;
        sender.send(UserCommand::Finish).unwrap();
        handle.await.unwrap();

        let sent_at = dispatcher.sent_at.lock().unwrap().clone();
        assert_eq!(sent_at.len(), 10);
        assert_eq!(context.metrics.snapshot().sessions, 5);
        for (index, pair) in sent_at.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            if index % 2 == 0 {
                // Latency plus think time within a session.
                assert!(gap < Duration::from_secs(1), "gap {:?} within session", gap);
            } else {
                assert!(gap >= Duration::from_secs(10), "gap {:?} between sessions", gap);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exit_stops_immediately() {
        let (context, dispatcher) = user_context(200, vec![]);
        let (sender, handle) = spawn_user(&context, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        sender.send(UserCommand::Exit).unwrap();
        handle.await.unwrap();
        let sent = dispatcher.requests.load(Ordering::SeqCst);
        assert!(sent > 0);

        // Nothing is sent after the user exited.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.requests.load(Ordering::SeqCst), sent);
        assert_eq!(context.metrics.snapshot().http_reqs, sent);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_before_first_session() {
        let (context, dispatcher) = user_context(200, vec![]);
        let (sender, receiver) = flume::unbounded();
        sender.send(UserCommand::Finish).unwrap();
        let user = VirtualUser::with_rng(1, context.clone(), StdRng::seed_from_u64(3));
        user_main(user, receiver).await;
        assert_eq!(dispatcher.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_check() {
        let (context, _) = user_context(200, vec!["Piwik Analytics".to_string()]);
        let (sender, handle) = spawn_user(&context, 4);
        tokio::time::sleep(Duration::from_secs(2)).await;
        sender.send(UserCommand::Exit).unwrap();
        handle.await.unwrap();

        let summary = context.metrics.snapshot();
        assert!(summary.http_reqs > 0);
        // 2xx responses without the expected marker fail the check only.
        assert_eq!(summary.http_req_failed.value(), Some(0.0));
        assert_eq!(summary.failed_tracking_requests, summary.http_reqs);

        let (context, _) = context_with_marker();
        let (sender, handle) = spawn_user(&context, 4);
        tokio::time::sleep(Duration::from_secs(2)).await;
        sender.send(UserCommand::Exit).unwrap();
        handle.await.unwrap();
        let summary = context.metrics.snapshot();
        assert_eq!(summary.successful_tracking_requests, summary.http_reqs);
    }

    fn context_with_marker() -> (Arc<UserContext>, Arc<StaticDispatcher>) {
        user_context(
            200,
            vec!["Piwik Analytics".to_string(), "Matomo Analytics".to_string()],
        )
    }
}

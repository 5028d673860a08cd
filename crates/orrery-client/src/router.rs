//! Topic routing.
//!
//! One subscription per session covers the whole namespace (`<prefix>.#`).
//! Each delivery has its namespace prefix stripped; the remaining routing key
//! is matched against the registered routes in registration order and the
//! first match handles it.
//!
//! Handlers are plain function pointers, so a route table is cheap to build
//! and carries no captured state. A handler's result decides the
//! acknowledgment ([`DispatchOutcome`]): [`Handled::Applied`] is acked,
//! [`Handled::Skipped`] and malformed or out-of-order deliveries are
//! ignored, and a failing handler is logged and never stops the dispatch loop.
//!
//! ```
//! use orrery_client::router::TopicRouter;
//! use orrery_wire::topic::Namespace;
//!
//! let router = TopicRouter::with_default_routes(Namespace::new("sos").unwrap(), "fire");
//! assert_eq!(router.route_name("sos.manager.status.time"), Some("manager.status.time"));
//! assert_eq!(router.route_name("sos.fire.location"), Some("fire.location"));
//! assert_eq!(router.route_name("sos.unknown.topic"), None);
//! assert_eq!(router.route_name("other.manager.init"), None);
//! ```

use orrery_wire::topic::{Namespace, TopicPattern};
use tokio::time::Instant;

use crate::engine::EngineState;
use crate::error::HandleError;
use crate::handlers;
use crate::transport::SessionId;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One delivery as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    /// Full topic, namespace prefix included.
    pub topic: &'a str,
    /// Topic with the namespace prefix stripped.
    pub routing_key: &'a str,
    pub body: &'a [u8],
    pub redelivered: bool,
    /// Real instant the delivery is processed at.
    pub real_now: Instant,
}

/// What a handler did with a well-formed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The state took the update (possibly buffered until the run starts).
    Applied,
    /// Understood but deliberately not applied: no session, or dropped by
    /// the pre-run policy.
    Skipped,
}

/// A message handler.
///
/// Handlers receive the mutable engine state and the delivery; the returned
/// value or error decides how the delivery is acknowledged.
pub type HandlerFn = fn(&mut EngineState, &Envelope<'_>) -> Result<Handled, HandleError>;

// ---------------------------------------------------------------------------
// TopicMatch
// ---------------------------------------------------------------------------

/// How a route selects routing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatch {
    /// The routing key equals the suffix.
    Exact(String),
    /// The routing key is the suffix or lies below it
    /// (`Prefix("fire")` matches `fire` and `fire.location`, not `firebase`).
    Prefix(String),
}

impl TopicMatch {
    pub fn matches(&self, routing_key: &str) -> bool {
        match self {
            TopicMatch::Exact(suffix) => routing_key == suffix,
            TopicMatch::Prefix(suffix) => routing_key
                .strip_prefix(suffix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.')),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchOutcome
// ---------------------------------------------------------------------------

/// Acknowledgment decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handled; acknowledge.
    Ack,
    /// Reject, optionally asking the broker to redeliver.
    Reject { requeue: bool },
    /// Not handled (unrouted, malformed, out of order or dropped by
    /// policy); acknowledge so it is not redelivered.
    Ignored,
}

impl DispatchOutcome {
    /// Whether the delivery should be acknowledged.
    pub fn acknowledges(self) -> bool {
        !matches!(self, DispatchOutcome::Reject { .. })
    }
}

/// The bound subscription of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub session: SessionId,
    pub pattern: TopicPattern,
}

// ---------------------------------------------------------------------------
// TopicRouter
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Route {
    name: String,
    matcher: TopicMatch,
    handler: HandlerFn,
}

/// Maps routing keys to handlers.
#[derive(Debug)]
pub struct TopicRouter {
    namespace: Namespace,
    routes: Vec<Route>,
}

impl TopicRouter {
    /// A router with no routes: every delivery is ignored.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            routes: Vec::new(),
        }
    }

    /// The standard route table: coordinator control, satellite and ground
    /// locations, `<target_app>.location`, and the detection / report events.
    pub fn with_default_routes(namespace: Namespace, target_app: &str) -> Self {
        let mut router = Self::new(namespace);
        router.add_exact("manager.init", handlers::on_init);
        router.add_exact("manager.start", handlers::on_start);
        router.add_exact("manager.time", handlers::on_time);
        router.add_exact("manager.status.time", handlers::on_time);
        router.add_exact("manager.update", handlers::on_update);
        router.add_exact("manager.stop", handlers::on_stop);
        router.add_exact("constellation.location", handlers::on_satellite_location);
        router.add_exact("ground.location", handlers::on_ground_location);
        router.add_exact(&format!("{target_app}.location"), handlers::on_target_location);
        router.add_exact("constellation.detected", handlers::on_detected);
        router.add_exact("constellation.reported", handlers::on_reported);
        router
    }

    fn add_exact(&mut self, suffix: &str, handler: HandlerFn) {
        self.add_route(suffix, TopicMatch::Exact(suffix.to_owned()), handler);
    }

    /// Register a route after all existing ones.
    ///
    /// # Panics
    ///
    /// Panics if a route with the same name is already registered.
    pub fn add_route(&mut self, name: &str, matcher: TopicMatch, handler: HandlerFn) {
        assert!(
            !self.routes.iter().any(|r| r.name == name),
            "duplicate route name: {name:?}"
        );
        self.routes.push(Route {
            name: name.to_owned(),
            matcher,
            handler,
        });
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The subscription pattern covering the namespace.
    pub fn pattern(&self) -> TopicPattern {
        self.namespace.wildcard()
    }

    /// Names of the registered routes, in match order.
    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.name.as_str())
    }

    fn resolve(&self, routing_key: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matcher.matches(routing_key))
    }

    /// Name of the route a full topic would be dispatched to.
    pub fn route_name(&self, topic: &str) -> Option<&str> {
        let key = self.namespace.strip(topic)?;
        self.resolve(key).map(|r| r.name.as_str())
    }

    /// Route one delivery and turn the handler result into an
    /// acknowledgment decision.
    pub fn dispatch(
        &self,
        state: &mut EngineState,
        topic: &str,
        body: &[u8],
        redelivered: bool,
        real_now: Instant,
    ) -> DispatchOutcome {
        let Some(routing_key) = self.namespace.strip(topic) else {
            tracing::debug!(topic = %topic, "topic outside the namespace; ignored");
            return DispatchOutcome::Ignored;
        };
        let Some(route) = self.resolve(routing_key) else {
            tracing::trace!(topic = %topic, "no route; ignored");
            return DispatchOutcome::Ignored;
        };
        let envelope = Envelope {
            topic,
            routing_key,
            body,
            redelivered,
            real_now,
        };

        match (route.handler)(state, &envelope) {
            Ok(Handled::Applied) => DispatchOutcome::Ack,
            Ok(Handled::Skipped) => {
                tracing::debug!(topic = %topic, route = %route.name, phase = ?state.phase(), "delivery not applied");
                DispatchOutcome::Ignored
            }
            Err(HandleError::Malformed(e)) => {
                tracing::warn!(topic = %topic, route = %route.name, error = %e, "malformed payload skipped");
                DispatchOutcome::Ignored
            }
            Err(HandleError::ProtocolState(e)) => {
                tracing::warn!(topic = %topic, route = %route.name, error = %e, "control message ignored");
                DispatchOutcome::Ignored
            }
            Err(e @ HandleError::UnknownIdentity { .. }) if redelivered => {
                tracing::warn!(topic = %topic, error = %e, "still unknown after redelivery; dropped");
                DispatchOutcome::Ignored
            }
            Err(e @ HandleError::UnknownIdentity { .. }) => {
                tracing::warn!(topic = %topic, error = %e, "requeued for redelivery");
                DispatchOutcome::Reject { requeue: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("sos").unwrap()
    }

    fn noop(_: &mut EngineState, _: &Envelope<'_>) -> Result<Handled, HandleError> {
        Ok(Handled::Applied)
    }

    fn skip(_: &mut EngineState, _: &Envelope<'_>) -> Result<Handled, HandleError> {
        Ok(Handled::Skipped)
    }

    #[test]
    fn default_table_covers_every_control_and_entity_topic() {
        let router = TopicRouter::with_default_routes(ns(), "flood");
        for (topic, route) in [
            ("sos.manager.init", "manager.init"),
            ("sos.manager.start", "manager.start"),
            ("sos.manager.time", "manager.time"),
            ("sos.manager.status.time", "manager.status.time"),
            ("sos.manager.update", "manager.update"),
            ("sos.manager.stop", "manager.stop"),
            ("sos.constellation.location", "constellation.location"),
            ("sos.ground.location", "ground.location"),
            ("sos.flood.location", "flood.location"),
            ("sos.constellation.detected", "constellation.detected"),
            ("sos.constellation.reported", "constellation.reported"),
        ] {
            assert_eq!(router.route_name(topic), Some(route), "{topic}");
        }
        assert_eq!(router.route_name("sos.fire.location"), None);
    }

    #[test]
    fn exact_does_not_match_deeper_keys() {
        let router = TopicRouter::with_default_routes(ns(), "fire");
        assert_eq!(router.route_name("sos.manager.init.extra"), None);
        assert_eq!(router.route_name("sos.manager"), None);
        assert_eq!(router.route_name("sos"), None);
    }

    #[test]
    fn prefix_matches_on_segment_boundaries() {
        let m = TopicMatch::Prefix("fire".to_owned());
        assert!(m.matches("fire"));
        assert!(m.matches("fire.location"));
        assert!(!m.matches("firebase.location"));
    }

    #[test]
    fn first_registered_route_wins() {
        let mut router = TopicRouter::new(ns());
        router.add_route("all-fire", TopicMatch::Prefix("fire".to_owned()), noop);
        router.add_route("fire-location", TopicMatch::Exact("fire.location".to_owned()), noop);
        assert_eq!(router.route_name("sos.fire.location"), Some("all-fire"));
        assert_eq!(
            router.route_names().collect::<Vec<_>>(),
            vec!["all-fire", "fire-location"]
        );
    }

    #[test]
    #[should_panic(expected = "duplicate route name")]
    fn duplicate_route_names_panic() {
        let mut router = TopicRouter::new(ns());
        router.add_route("a", TopicMatch::Exact("x".to_owned()), noop);
        router.add_route("a", TopicMatch::Exact("y".to_owned()), noop);
    }

    #[test]
    fn skipped_deliveries_are_ignored_not_acked_as_handled() {
        use crate::config::PreRunPolicy;

        let mut router = TopicRouter::new(ns());
        router.add_route("applied", TopicMatch::Exact("a".to_owned()), noop);
        router.add_route("skipped", TopicMatch::Exact("b".to_owned()), skip);
        let mut state = EngineState::new(Default::default(), Default::default(), PreRunPolicy::Apply);
        let now = Instant::now();
        assert_eq!(router.dispatch(&mut state, "sos.a", b"{}", false, now), DispatchOutcome::Ack);
        let skipped = router.dispatch(&mut state, "sos.b", b"{}", false, now);
        assert_eq!(skipped, DispatchOutcome::Ignored);
        assert!(skipped.acknowledges());
    }

    #[test]
    fn only_rejections_skip_the_ack() {
        assert!(DispatchOutcome::Ack.acknowledges());
        assert!(DispatchOutcome::Ignored.acknowledges());
        assert!(!DispatchOutcome::Reject { requeue: true }.acknowledges());
    }

    #[test]
    fn pattern_is_the_namespace_wildcard() {
        assert_eq!(TopicRouter::new(ns()).pattern().as_str(), "sos.#");
    }
}

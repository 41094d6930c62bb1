//! Path/format auto-detection.
//!
//! Clients regularly point an SDK for one protocol at another protocol's
//! endpoint. When enabled, each of the three chat-style endpoints probes
//! the body; on a mismatch the request is either re-dispatched internally
//! to the canonical handler (`transparent`) or answered with a 302
//! (`redirect`, documented as unreliable for POST bodies).

use super::detect::{detect_value, PayloadFormat};
use crate::config::{self, AutoDetectAction};
use crate::logger;

/// Canonical endpoint for each detectable format.
pub fn canonical_path(format: PayloadFormat) -> Option<&'static str> {
    match format {
        PayloadFormat::Chat => Some("/v1/chat/completions"),
        PayloadFormat::Responses => Some("/v1/responses"),
        PayloadFormat::Claude => Some("/v1/messages"),
        PayloadFormat::Unknown => None,
    }
}

/// Expected format for a public path, if it is one of the three chat-style
/// endpoints.
pub fn expected_format(path: &str) -> Option<PayloadFormat> {
    if path.starts_with("/v1/chat/completions") {
        Some(PayloadFormat::Chat)
    } else if path.starts_with("/v1/responses") {
        Some(PayloadFormat::Responses)
    } else if path.starts_with("/v1/messages") {
        Some(PayloadFormat::Claude)
    } else {
        None
    }
}

/// What a handler should do with an incoming body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Handle in place.
    Proceed,
    /// Re-enter the canonical handler for this format, once.
    Rehandle(PayloadFormat),
    /// Answer 302 to this location (query string preserved by the caller).
    Redirect(&'static str),
}

/// Decide how to route `payload` arriving on the endpoint expecting
/// `expected`. `already_rerouted` breaks the recursion after one internal
/// re-dispatch.
pub fn decide(
    expected: PayloadFormat,
    payload: &serde_json::Value,
    already_rerouted: bool,
) -> RouteDecision {
    let cfg = config::load();
    if !cfg.auto_detect_format || already_rerouted {
        return RouteDecision::Proceed;
    }

    let detected = detect_value(payload);
    // Unknown keeps the original path: shared shapes must never be
    // misrouted.
    if detected == PayloadFormat::Unknown || detected == expected {
        return RouteDecision::Proceed;
    }

    logger::info(
        "autoroute",
        &format!(
            "detected {} payload on the {} endpoint",
            detected.as_str(),
            expected.as_str()
        ),
    );

    match cfg.auto_detect_action {
        AutoDetectAction::Transparent => RouteDecision::Rehandle(detected),
        AutoDetectAction::Redirect => match canonical_path(detected) {
            Some(path) => RouteDecision::Redirect(path),
            None => RouteDecision::Proceed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use serde_json::json;

    #[test]
    fn matching_format_proceeds() {
        let _lock = config::test_support::lock();
        config::install(Settings::default());
        let payload = json!({"model": "gpt-4o", "input": "hi"});
        assert_eq!(
            decide(PayloadFormat::Responses, &payload, false),
            RouteDecision::Proceed
        );
    }

    #[test]
    fn mismatch_rehandles_transparently() {
        let _lock = config::test_support::lock();
        config::install(Settings::default());
        let payload = json!({"model": "gpt-4o", "input": "hi"});
        assert_eq!(
            decide(PayloadFormat::Chat, &payload, false),
            RouteDecision::Rehandle(PayloadFormat::Responses)
        );
        // Never twice.
        assert_eq!(
            decide(PayloadFormat::Chat, &payload, true),
            RouteDecision::Proceed
        );
    }

    #[test]
    fn redirect_action_returns_location() {
        let _lock = config::test_support::lock();
        let mut cfg = Settings::default();
        cfg.auto_detect_action = AutoDetectAction::Redirect;
        config::install(cfg);
        let payload = json!({
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t", "content": "x"}]}],
        });
        assert_eq!(
            decide(PayloadFormat::Chat, &payload, false),
            RouteDecision::Redirect("/v1/messages")
        );
        config::install(Settings::default());
    }

    #[test]
    fn unknown_respects_original_path() {
        let _lock = config::test_support::lock();
        config::install(Settings::default());
        let payload = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(
            decide(PayloadFormat::Responses, &payload, false),
            RouteDecision::Proceed
        );
    }

    #[test]
    fn disabled_detector_never_reroutes() {
        let _lock = config::test_support::lock();
        let mut cfg = Settings::default();
        cfg.auto_detect_format = false;
        config::install(cfg);
        let payload = json!({"model": "gpt-4o", "input": "hi"});
        assert_eq!(
            decide(PayloadFormat::Chat, &payload, false),
            RouteDecision::Proceed
        );
        config::install(Settings::default());
    }

    #[test]
    fn path_tables() {
        assert_eq!(expected_format("/v1/messages"), Some(PayloadFormat::Claude));
        assert_eq!(
            expected_format("/v1/chat/completions"),
            Some(PayloadFormat::Chat)
        );
        assert_eq!(expected_format("/v1/embeddings"), None);
        assert_eq!(canonical_path(PayloadFormat::Unknown), None);
    }
}

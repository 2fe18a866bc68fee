//! Translation between bus topics and virtual pins.
//!
//! Inbound bus messages are routed in a fixed order:
//!
//! 1. `<base>/vw/<pin>` writes the pin on the device.
//! 2. `<base>/<legacy suffix>` writes the pin mapped to that suffix.
//! 3. `<base>/<link id or index>/vw/<pin>` forwards the write to a bridge link.
//!
//! Device-originated values are only ever published under
//! `<base>/vw/<pin>`; legacy suffixes are write-only aliases.

use crate::{
    bridge::BridgeLink,
    pins::{PinNumber, parse_pin},
};

/// Legacy sensor topics mapped to pins by default.
pub const DEFAULT_LEGACY_TOPICS: [(&str, PinNumber); 6] = [
    ("sensors/bmpt", 0),
    ("sensors/bmpp", 1),
    ("sensors/dhtt1", 2),
    ("sensors/dhth1", 3),
    ("sensors/freemem", 4),
    ("sensors/uptime", 5),
];

const WRITE: &str = "vw";
const READ: &str = "vr";

/// Where an inbound bus message should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Write a pin on the primary device.
    Pin(PinNumber),
    /// Forward a pin write through a bridge link.
    Bridge {
        /// Position of the link in the configured list.
        link: usize,
        /// Pin on the remote device.
        pin: PinNumber,
    },
}

/// Immutable topic layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMapping {
    base: String,
    legacy: Vec<(String, PinNumber)>,
}

impl TopicMapping {
    /// Build a mapping rooted at `base`.
    ///
    /// A trailing `/` on `base` is ignored. Legacy entries are matched in
    /// the order given.
    #[must_use]
    pub fn new<I, S>(base: &str, legacy: I) -> Self
    where
        I: IntoIterator<Item = (S, PinNumber)>,
        S: Into<String>,
    {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            legacy: legacy
                .into_iter()
                .map(|(suffix, pin)| (suffix.into(), pin))
                .collect(),
        }
    }

    /// Mapping rooted at `base` with the default legacy table.
    #[must_use]
    pub fn with_defaults(base: &str) -> Self { Self::new(base, DEFAULT_LEGACY_TOPICS) }

    /// Base topic.
    #[must_use]
    pub fn base(&self) -> &str { &self.base }

    /// Legacy suffix table.
    #[must_use]
    pub fn legacy(&self) -> &[(String, PinNumber)] { &self.legacy }

    /// Pattern covering every topic the bridge consumes.
    #[must_use]
    pub fn subscription(&self) -> String { format!("{}/#", self.base) }

    /// Topic on which device writes to `pin` are published.
    #[must_use]
    pub fn write_topic(&self, pin: PinNumber) -> String { format!("{}/{WRITE}/{pin}", self.base) }

    /// Topic on which device reads of `pin` are announced.
    #[must_use]
    pub fn read_topic(&self, pin: PinNumber) -> String { format!("{}/{READ}/{pin}", self.base) }

    /// Decide where a message on `topic` should go.
    ///
    /// Returns `None` for topics outside the bridge's write surface.
    #[must_use]
    pub fn route(&self, topic: &str, links: &[BridgeLink]) -> Option<Route> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();

        if let [WRITE, pin] = segments.as_slice() {
            return parse_pin(pin.as_bytes()).ok().map(Route::Pin);
        }

        if let Some((_, pin)) = self.legacy.iter().find(|(suffix, _)| suffix == rest) {
            return Some(Route::Pin(*pin));
        }

        if let [target, WRITE, pin] = segments.as_slice() {
            let link = links.iter().position(|link| link.matches(target))?;
            let pin = parse_pin(pin.as_bytes()).ok()?;
            return Some(Route::Bridge { link, pin });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn mapping() -> TopicMapping { TopicMapping::with_defaults("/blynk") }

    #[fixture]
    fn links() -> Vec<BridgeLink> {
        vec![
            BridgeLink::new(1, "AnotherAppToken"),
            BridgeLink::new(2, "ThirdToken"),
        ]
    }

    #[rstest]
    #[case("/blynk/vw/0", Some(Route::Pin(0)))]
    #[case("/blynk/vw/17", Some(Route::Pin(17)))]
    #[case("/blynk/sensors/bmpt", Some(Route::Pin(0)))]
    #[case("/blynk/sensors/uptime", Some(Route::Pin(5)))]
    #[case("/blynk/AnotherAppToken/vw/3", Some(Route::Bridge { link: 0, pin: 3 }))]
    #[case("/blynk/2/vw/9", Some(Route::Bridge { link: 1, pin: 9 }))]
    #[case("/blynk/vr/3", None)]
    #[case("/blynk/vw/abc", None)]
    #[case("/blynk/vw", None)]
    #[case("/blynk/Unknown/vw/3", None)]
    #[case("/blynk/3/vw/1", None)]
    #[case("/blynkish/vw/1", None)]
    #[case("/other/vw/1", None)]
    #[case("/blynk/sensors/bmpt/extra", None)]
    fn routes_topics(
        mapping: TopicMapping,
        links: Vec<BridgeLink>,
        #[case] topic: &str,
        #[case] expected: Option<Route>,
    ) {
        assert_eq!(mapping.route(topic, &links), expected);
    }

    #[rstest]
    fn generic_pattern_wins_over_legacy_table() {
        let mapping = TopicMapping::new("base", [("vw/1", 9)]);
        assert_eq!(mapping.route("base/vw/1", &[]), Some(Route::Pin(1)));
    }

    #[rstest]
    fn legacy_alias_and_generic_topic_route_identically(mapping: TopicMapping) {
        assert_eq!(
            mapping.route("/blynk/sensors/bmpt", &[]),
            mapping.route("/blynk/vw/0", &[])
        );
    }

    #[rstest]
    fn outbound_topics_use_generic_pattern(mapping: TopicMapping) {
        assert_eq!(mapping.write_topic(0), "/blynk/vw/0");
        assert_eq!(mapping.read_topic(7), "/blynk/vr/7");
        assert_eq!(mapping.subscription(), "/blynk/#");
    }

    #[test]
    fn trailing_slash_on_base_is_ignored() {
        let mapping = TopicMapping::with_defaults("home/");
        assert_eq!(mapping.base(), "home");
        assert_eq!(mapping.route("home/vw/2", &[]), Some(Route::Pin(2)));
    }
}

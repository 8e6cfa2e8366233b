//! Hands-free routing through PulseAudio / PipeWire
//!
//! The SCO link is brought up by switching the BlueZ card to its hands-free
//! profile with `pactl set-card-profile`. Link-state notifications come from
//! a `pactl subscribe` child process: every card event re-reads the card list
//! and a notification is emitted when the card enters or leaves the
//! hands-free profile. The monitor and `start_sco` share the last observed
//! card condition, so a switch is reported once by whichever sees it first.

use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::bluetooth::routing::{
    LinkListener, LinkState, ListenerRegistry, RoutingLayer, SubscriptionId,
};
use crate::config::BluetoothConfig;
use crate::error::BluetoothError;

const BLUEZ_CARD_PREFIX: &str = "bluez_card.";

/// One card from `pactl list cards`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub index: u32,
    pub name: String,
    /// Profile names with their availability
    pub profiles: Vec<(String, bool)>,
    pub active_profile: Option<String>,
}

impl CardInfo {
    pub fn is_bluez(&self) -> bool {
        self.name.starts_with(BLUEZ_CARD_PREFIX)
    }

    /// Device address part of the card name, e.g. `00_1B_66_AA_BB_CC`
    pub fn address(&self) -> &str {
        self.name.strip_prefix(BLUEZ_CARD_PREFIX).unwrap_or(&self.name)
    }

    /// First available profile whose name starts with `prefix`
    pub fn find_profile(&self, prefix: &str) -> Option<&str> {
        self.profiles
            .iter()
            .find(|(name, available)| *available && name.starts_with(prefix))
            .map(|(name, _)| name.as_str())
    }

    pub fn is_profile_active(&self, prefix: &str) -> bool {
        self.active_profile
            .as_deref()
            .map(|p| p.starts_with(prefix))
            .unwrap_or(false)
    }
}

/// Parse the long-form output of `pactl list cards`
pub fn parse_cards(text: &str) -> Vec<CardInfo> {
    let mut cards = Vec::new();
    let mut current: Option<CardInfo> = None;
    let mut profiles_indent: Option<usize> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        let trimmed = trimmed.trim_end();

        if let Some(index) = trimmed.strip_prefix("Card #") {
            if let Some(card) = current.take() {
                cards.push(card);
            }
            current = Some(CardInfo {
                index: index.parse().unwrap_or(0),
                name: String::new(),
                profiles: Vec::new(),
                active_profile: None,
            });
            profiles_indent = None;
            continue;
        }
        let Some(card) = current.as_mut() else { continue };

        if let Some(section_indent) = profiles_indent {
            if indent > section_indent && !trimmed.is_empty() {
                if let Some((name, rest)) = trimmed.split_once(": ") {
                    let available = !rest.contains("available: no");
                    card.profiles.push((name.to_string(), available));
                }
                continue;
            }
            profiles_indent = None;
        }

        if trimmed == "Profiles:" {
            profiles_indent = Some(indent);
        } else if let Some(name) = trimmed.strip_prefix("Name: ") {
            card.name = name.to_string();
        } else if let Some(profile) = trimmed.strip_prefix("Active Profile: ") {
            card.active_profile = Some(profile.to_string());
        }
    }
    if let Some(card) = current {
        cards.push(card);
    }
    cards
}

/// Names from `pactl list short sources|sinks`
pub fn parse_short_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(str::to_string)
        .collect()
}

/// Whether a `pactl subscribe` line reports a card event
pub fn is_card_event(line: &str) -> bool {
    line.starts_with("Event '") && line.contains(" on card #")
}

/// Coarse link condition derived from the card list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardCondition {
    Absent,
    Idle,
    HandsFree,
}

/// Routing layer backed by the `pactl` command-line tool
pub struct PulseRouting {
    config: BluetoothConfig,
    registry: Arc<ListenerRegistry>,
    monitor: Mutex<Option<Child>>,
    /// Last observed condition of the headset card
    condition: Arc<Mutex<CardCondition>>,
    routing_on: AtomicBool,
    /// Default source and sink before routing moved to the headset
    previous_defaults: Mutex<Option<(String, String)>>,
    /// Card profile active before the SCO request
    previous_profile: Mutex<Option<String>>,
}

impl PulseRouting {
    pub fn new(config: BluetoothConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ListenerRegistry::new()),
            monitor: Mutex::new(None),
            condition: Arc::new(Mutex::new(CardCondition::Absent)),
            routing_on: AtomicBool::new(false),
            previous_defaults: Mutex::new(None),
            previous_profile: Mutex::new(None),
        }
    }

    /// Whether the `pactl` tool can be run at all
    pub fn is_available() -> bool {
        Command::new("pactl")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// The headset card this routing layer drives
    pub fn find_card(&self) -> Result<CardInfo, BluetoothError> {
        let cards = parse_cards(&pactl(&["list", "cards"])?);
        select_card(&cards, self.config.card.as_deref(), &self.config.hands_free_profile)
            .cloned()
            .ok_or(BluetoothError::Unsupported)
    }

    fn ensure_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor_alive(&mut monitor) {
            return;
        }

        let child = Command::new("pactl")
            .arg("subscribe")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Cannot watch link state, pactl subscribe failed: {}", e);
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return;
        };

        // Baseline before any request can switch the profile
        let baseline = read_condition(self.config.card.as_deref(), &self.config.hands_free_profile);
        *self.condition.lock() = baseline;

        let registry = self.registry.clone();
        let condition = self.condition.clone();
        let card_filter = self.config.card.clone();
        let profile = self.config.hands_free_profile.clone();
        let spawned = thread::Builder::new()
            .name("pactl-monitor".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if !is_card_event(&line) {
                        continue;
                    }
                    let mut last = condition.lock();
                    let next = read_condition(card_filter.as_deref(), &profile);
                    let change = advance(&mut last, next);
                    drop(last);
                    if let Some(state) = change {
                        tracing::debug!("Headset card is now {:?}", next);
                        registry.notify(state);
                    }
                }
                tracing::debug!("pactl monitor exited");
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to start pactl monitor thread: {}", e);
            let _ = child.kill();
            return;
        }
        *monitor = Some(child);
    }

    /// Re-read the card and report a change the monitor has not seen yet
    fn refresh(&self) -> Result<(), BluetoothError> {
        let mut last = self.condition.lock();
        let next = read_condition(self.config.card.as_deref(), &self.config.hands_free_profile);
        let change = advance(&mut last, next);
        drop(last);
        match change {
            Some(state) => self.notify_async(state),
            None => Ok(()),
        }
    }

    /// Notifications are delivered off the caller's thread
    fn notify_async(&self, state: LinkState) -> Result<(), BluetoothError> {
        let registry = self.registry.clone();
        thread::Builder::new()
            .name("pactl-notify".to_string())
            .spawn(move || registry.notify(state))
            .map(|_| ())
            .map_err(|e| BluetoothError::Routing(e.to_string()))
    }

    fn remember_defaults(&self) -> Result<(), BluetoothError> {
        let source = pactl(&["get-default-source"])?.trim().to_string();
        let sink = pactl(&["get-default-sink"])?.trim().to_string();
        *self.previous_defaults.lock() = Some((source, sink));
        Ok(())
    }
}

impl RoutingLayer for PulseRouting {
    fn name(&self) -> &str {
        "pulse"
    }

    fn is_sco_available(&self) -> bool {
        self.find_card().is_ok()
    }

    fn start_sco(&self) -> Result<(), BluetoothError> {
        let card = self.find_card()?;
        let profile = card
            .find_profile(&self.config.hands_free_profile)
            .ok_or(BluetoothError::Unsupported)?
            .to_string();

        if card.is_profile_active(&self.config.hands_free_profile) {
            // Already up, so no card event will follow
            *self.condition.lock() = CardCondition::HandsFree;
            return self.notify_async(LinkState::Connected);
        }

        *self.previous_profile.lock() = card.active_profile.clone();
        tracing::info!("Switching {} to profile {}", card.name, profile);
        pactl(&["set-card-profile", card.name.as_str(), profile.as_str()])?;

        // The switch may finish before the monitor is listening
        self.refresh()
    }

    fn stop_sco(&self) -> Result<(), BluetoothError> {
        let card = match self.find_card() {
            Ok(card) => card,
            // Headset gone, nothing left to take down
            Err(BluetoothError::Unsupported) => return Ok(()),
            Err(e) => return Err(e),
        };
        let restore = self
            .previous_profile
            .lock()
            .take()
            .filter(|p| !p.starts_with(&self.config.hands_free_profile))
            .unwrap_or_else(|| self.config.restore_profile.clone());

        tracing::info!("Switching {} back to profile {}", card.name, restore);
        pactl(&["set-card-profile", card.name.as_str(), restore.as_str()]).map(|_| ())
    }

    fn set_sco_routing(&self, on: bool) -> Result<(), BluetoothError> {
        if on {
            let card = self.find_card()?;
            let address = card.address().to_string();
            let sources = parse_short_list(&pactl(&["list", "short", "sources"])?);
            let sinks = parse_short_list(&pactl(&["list", "short", "sinks"])?);

            let source = sources
                .iter()
                .find(|s| s.contains(&address) && !s.ends_with(".monitor"))
                .ok_or_else(|| {
                    BluetoothError::Routing(format!("no headset source for {}", address))
                })?;
            let sink = sinks
                .iter()
                .find(|s| s.contains(&address))
                .ok_or_else(|| {
                    BluetoothError::Routing(format!("no headset sink for {}", address))
                })?;

            if let Err(e) = self.remember_defaults() {
                tracing::warn!("Could not read current default devices: {}", e);
            }
            pactl(&["set-default-source", source.as_str()])?;
            pactl(&["set-default-sink", sink.as_str()])?;
            self.routing_on.store(true, Ordering::SeqCst);
            tracing::info!("Audio routed to headset ({} / {})", source, sink);
        } else {
            self.routing_on.store(false, Ordering::SeqCst);
            if let Some((source, sink)) = self.previous_defaults.lock().take() {
                let restored_source = pactl(&["set-default-source", source.as_str()]);
                let restored_sink = pactl(&["set-default-sink", sink.as_str()]);
                restored_source.and(restored_sink)?;
                tracing::info!("Audio routing restored ({} / {})", source, sink);
            }
        }
        Ok(())
    }

    fn is_sco_routing_on(&self) -> bool {
        self.routing_on.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: LinkListener) -> SubscriptionId {
        self.ensure_monitor();
        self.registry.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.registry.remove(id);
    }
}

impl Drop for PulseRouting {
    fn drop(&mut self) {
        if let Some(mut child) = self.monitor.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn pactl(args: &[&str]) -> Result<String, BluetoothError> {
    let output = Command::new("pactl")
        .args(args)
        .output()
        .map_err(|e| BluetoothError::Routing(format!("pactl: {}", e)))?;
    if !output.status.success() {
        return Err(BluetoothError::Routing(format!(
            "pactl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn select_card<'a>(
    cards: &'a [CardInfo],
    filter: Option<&str>,
    profile: &str,
) -> Option<&'a CardInfo> {
    cards.iter().find(|card| {
        card.is_bluez()
            && filter.map(|f| card.name.contains(f)).unwrap_or(true)
            && card.find_profile(profile).is_some()
    })
}

fn read_condition(filter: Option<&str>, profile: &str) -> CardCondition {
    let cards = match pactl(&["list", "cards"]) {
        Ok(text) => parse_cards(&text),
        Err(_) => return CardCondition::Absent,
    };
    match select_card(&cards, filter, profile) {
        Some(card) if card.is_profile_active(profile) => CardCondition::HandsFree,
        Some(_) => CardCondition::Idle,
        None => CardCondition::Absent,
    }
}

/// Record `next` as the observed condition, returning the notification it implies
fn advance(last: &mut CardCondition, next: CardCondition) -> Option<LinkState> {
    let change = transition(*last, next);
    *last = next;
    change
}

/// Whether the monitor child is still running; reaps it if it exited
fn monitor_alive(monitor: &mut Option<Child>) -> bool {
    let Some(child) = monitor.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            tracing::debug!("pactl monitor exited ({}), restarting", status);
            *monitor = None;
            false
        }
        Err(e) => {
            tracing::debug!("pactl monitor unreachable ({}), restarting", e);
            if let Some(mut child) = monitor.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            false
        }
    }
}

fn transition(from: CardCondition, to: CardCondition) -> Option<LinkState> {
    match (from, to) {
        (a, b) if a == b => None,
        (_, CardCondition::HandsFree) => Some(LinkState::Connected),
        (CardCondition::HandsFree, _) => Some(LinkState::Disconnected),
        (CardCondition::Idle, CardCondition::Absent) => Some(LinkState::Disconnected),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARDS: &str = "Card #41
\tName: alsa_card.pci-0000_00_1f.3
\tDriver: module-alsa-card.c
\tProfiles:
\t\toutput:analog-stereo: Analog Stereo Output (sinks: 1, sources: 0, priority: 6500, available: yes)
\tActive Profile: output:analog-stereo
\tPorts:
Card #52
\tName: bluez_card.00_1B_66_AA_BB_CC
\tDriver: module-bluez5-device.c
\tProfiles:
\t\ta2dp-sink: High Fidelity Playback (A2DP Sink) (sinks: 1, sources: 0, priority: 40, available: yes)
\t\theadset-head-unit-cvsd: Headset Head Unit (HSP/HFP, codec CVSD) (sinks: 1, sources: 1, priority: 20, available: no)
\t\theadset-head-unit: Headset Head Unit (HSP/HFP) (sinks: 1, sources: 1, priority: 30, available: yes)
\t\toff: Off (sinks: 0, sources: 0, priority: 0, available: yes)
\tActive Profile: a2dp-sink
\tPorts:
";

    #[test]
    fn test_parse_cards() {
        let cards = parse_cards(CARDS);
        assert_eq!(cards.len(), 2);

        let headset = &cards[1];
        assert_eq!(headset.index, 52);
        assert!(headset.is_bluez());
        assert_eq!(headset.address(), "00_1B_66_AA_BB_CC");
        assert_eq!(headset.profiles.len(), 4);
        assert_eq!(headset.active_profile.as_deref(), Some("a2dp-sink"));
        assert_eq!(headset.find_profile("headset-head-unit"), Some("headset-head-unit"));
        assert!(!headset.is_profile_active("headset-head-unit"));

        assert!(!cards[0].is_bluez());
        assert_eq!(cards[0].active_profile.as_deref(), Some("output:analog-stereo"));
    }

    #[test]
    fn test_select_card_requires_hands_free_profile() {
        let cards = parse_cards(CARDS);
        assert_eq!(select_card(&cards, None, "headset-head-unit").unwrap().index, 52);
        assert!(select_card(&cards, Some("00_1B_66"), "headset-head-unit").is_some());
        assert!(select_card(&cards, Some("11_22"), "headset-head-unit").is_none());
        assert!(select_card(&cards, None, "handsfree-gateway").is_none());
    }

    #[test]
    fn test_parse_short_list() {
        let text = "12\tbluez_input.00_1B_66_AA_BB_CC.0\tPipeWire\ts16le 1ch 16000Hz\tSUSPENDED\n\
                    13\talsa_input.pci.analog-stereo\tPipeWire\ts32le 2ch 48000Hz\tRUNNING\n";
        assert_eq!(
            parse_short_list(text),
            vec!["bluez_input.00_1B_66_AA_BB_CC.0", "alsa_input.pci.analog-stereo"]
        );
    }

    #[test]
    fn test_card_event_lines() {
        assert!(is_card_event("Event 'change' on card #52"));
        assert!(is_card_event("Event 'remove' on card #52"));
        assert!(!is_card_event("Event 'change' on sink #3"));
    }

    #[test]
    fn test_transitions() {
        use CardCondition::*;
        assert_eq!(transition(Idle, HandsFree), Some(LinkState::Connected));
        assert_eq!(transition(Absent, HandsFree), Some(LinkState::Connected));
        assert_eq!(transition(HandsFree, Idle), Some(LinkState::Disconnected));
        assert_eq!(transition(HandsFree, Absent), Some(LinkState::Disconnected));
        assert_eq!(transition(Idle, Absent), Some(LinkState::Disconnected));
        assert_eq!(transition(Idle, Idle), None);
        assert_eq!(transition(Absent, Idle), None);
    }

    #[test]
    fn test_switch_is_reported_once() {
        use CardCondition::*;
        // Baseline taken before the request
        let mut last = Idle;
        // The requester sees the switch before the monitor does
        assert_eq!(advance(&mut last, HandsFree), Some(LinkState::Connected));
        // The monitor's card event then finds nothing new
        assert_eq!(advance(&mut last, HandsFree), None);
        assert_eq!(advance(&mut last, Idle), Some(LinkState::Disconnected));
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_monitor_is_reaped() {
        let mut monitor = None;
        assert!(!monitor_alive(&mut monitor));

        let child = Command::new("true").spawn().unwrap();
        monitor = Some(child);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while monitor_alive(&mut monitor) && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(monitor.is_none());
    }
}

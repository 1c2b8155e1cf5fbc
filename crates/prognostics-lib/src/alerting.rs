//! Hysteretic alert state per asset component
//!
//! Every level change needs a streak of consecutive predictions: entering
//! WARNING or CRITICAL takes K breaching predictions, leaving takes K clearing
//! ones. A missing prediction is no evidence at all and leaves every streak
//! untouched.

use crate::config::{AlertPolicy, ComponentConfig};
use crate::models::{
    AlertLevel, AlertState, AlertTransition, AssetId, ComponentId, Prediction, PredictionKind,
};
use std::collections::BTreeMap;

/// Observer of alert level changes, called once per transition in order
pub trait AlertListener {
    fn on_alert_change(&mut self, transition: &AlertTransition);
}

/// Which side of a threshold counts as a breach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breach {
    /// RUL hours: fewer hours than the horizon
    Below,
    /// Anomaly score: at or above the threshold
    AtOrAbove,
}

impl Breach {
    fn crosses(self, value: f64, threshold: f64) -> bool {
        match self {
            Breach::Below => value < threshold,
            Breach::AtOrAbove => value >= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rule {
    kind: PredictionKind,
    breach: Breach,
    warning: f64,
    critical: f64,
    warning_count: u32,
    critical_count: u32,
}

impl Rule {
    fn from_policy(policy: &AlertPolicy) -> Self {
        match policy {
            AlertPolicy::Rul(p) => Self {
                kind: PredictionKind::Rul,
                breach: Breach::Below,
                warning: p.warning_hours,
                critical: p.critical_hours,
                warning_count: p.debounce,
                critical_count: p.debounce,
            },
            AlertPolicy::Anomaly(p) => Self {
                kind: PredictionKind::Anomaly,
                breach: Breach::AtOrAbove,
                warning: p.warning_threshold,
                critical: p.critical_threshold,
                warning_count: p.warning_count,
                critical_count: p.critical_count,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Track {
    state: AlertState,
    warn_breach: u32,
    crit_breach: u32,
    warn_clear: u32,
    crit_clear: u32,
}

impl Track {
    fn record(&mut self, rule: &Rule, value: f64) {
        let bump = |hit: bool, streak: &mut u32| {
            *streak = if hit { streak.saturating_add(1) } else { 0 };
        };
        let warn = rule.breach.crosses(value, rule.warning);
        let crit = rule.breach.crosses(value, rule.critical);
        bump(warn, &mut self.warn_breach);
        bump(!warn, &mut self.warn_clear);
        bump(crit, &mut self.crit_breach);
        bump(!crit, &mut self.crit_clear);
    }

    fn next_level(&self, rule: &Rule) -> AlertLevel {
        let (kw, kc) = (rule.warning_count, rule.critical_count);
        match self.state.level {
            AlertLevel::Normal if self.crit_breach >= kc => AlertLevel::Critical,
            AlertLevel::Normal if self.warn_breach >= kw => AlertLevel::Warning,
            AlertLevel::Warning if self.crit_breach >= kc => AlertLevel::Critical,
            AlertLevel::Warning if self.warn_clear >= kw => AlertLevel::Normal,
            AlertLevel::Critical if self.crit_clear >= kc => {
                if self.warn_clear >= kw {
                    AlertLevel::Normal
                } else {
                    AlertLevel::Warning
                }
            }
            level => level,
        }
    }

    /// Streak currently pushing toward the next transition
    fn pending(&self) -> u32 {
        match self.state.level {
            AlertLevel::Normal => self.warn_breach.max(self.crit_breach),
            AlertLevel::Warning => self.crit_breach.max(self.warn_clear),
            AlertLevel::Critical => self.crit_clear,
        }
    }
}

/// Alert state machines of one asset's components
///
/// Owned and mutated only by the asset's processing unit.
#[derive(Debug, Clone)]
pub struct AlertStateMachine {
    asset: AssetId,
    rules: BTreeMap<ComponentId, Rule>,
    tracks: BTreeMap<ComponentId, Track>,
}

impl AlertStateMachine {
    pub fn new(asset: AssetId, components: &[ComponentConfig]) -> Self {
        Self {
            asset,
            rules: components
                .iter()
                .map(|c| (c.name.clone(), Rule::from_policy(&c.policy)))
                .collect(),
            tracks: BTreeMap::new(),
        }
    }

    /// Fold one cycle's evidence for a component into its state
    ///
    /// `None` means the window produced no usable prediction; it never moves
    /// the state in either direction. Predictions of the wrong kind for the
    /// component's policy are ignored.
    pub fn observe(
        &mut self,
        component: &ComponentId,
        evidence: Option<&Prediction>,
        listener: &mut dyn AlertListener,
    ) -> Option<AlertTransition> {
        let prediction = evidence?;
        let rule = self.rules.get(component)?;
        if prediction.kind != rule.kind {
            return None;
        }

        let track = self.tracks.entry(component.clone()).or_insert_with(|| Track {
            state: AlertState {
                entered_at: prediction.timestamp,
                ..AlertState::default()
            },
            ..Track::default()
        });
        track.record(rule, prediction.value);

        let from = track.state.level;
        let to = track.next_level(rule);
        if from == to {
            track.state.consecutive = track.pending();
            return None;
        }

        track.state = AlertState {
            level: to,
            entered_at: prediction.timestamp,
            consecutive: 0,
        };
        track.state.consecutive = track.pending();

        let transition = AlertTransition {
            asset: self.asset.clone(),
            component: component.clone(),
            from,
            to,
            at: prediction.timestamp,
            trigger: prediction.kind,
            value: prediction.value,
        };
        listener.on_alert_change(&transition);
        Some(transition)
    }

    /// Current state; components without evidence yet are NORMAL
    pub fn state(&self, component: &ComponentId) -> AlertState {
        self.tracks
            .get(component)
            .map(|t| t.state)
            .unwrap_or_default()
    }

    pub fn level(&self, component: &ComponentId) -> AlertLevel {
        self.state(component).level
    }

    /// Declared components in name order
    pub fn components(&self) -> impl Iterator<Item = &ComponentId> + '_ {
        self.rules.keys()
    }

    /// Components whose policy consumes predictions of `kind`
    pub fn components_for(&self, kind: PredictionKind) -> Vec<ComponentId> {
        self.rules
            .iter()
            .filter(|(_, rule)| rule.kind == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Listener that collects transitions, for callers that only need the list
#[derive(Debug, Default)]
pub struct TransitionLog(pub Vec<AlertTransition>);

impl AlertListener for TransitionLog {
    fn on_alert_change(&mut self, transition: &AlertTransition) {
        self.0.push(transition.clone());
    }
}

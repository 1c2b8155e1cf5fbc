//! Health scoring and maintenance task lifecycle for one asset
//!
//! Tasks follow alert transitions: escalation out of NORMAL opens a task,
//! WARNING to CRITICAL supersedes the open task with a more urgent one, a
//! return to NORMAL closes it. At most one task per component is open.

use crate::alerting::{AlertListener, AlertStateMachine};
use crate::config::{AlertPolicy, ComponentConfig, HealthWeights, MaintenanceConfig};
use crate::models::{
    AlertLevel, AlertTransition, AssetId, ComponentId, MaintenanceTask, TaskStatus, Timestamp,
    MILLIS_PER_HOUR,
};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A change to the task list, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum TaskChange {
    Opened(MaintenanceTask),
    Superseded(MaintenanceTask),
    Closed(MaintenanceTask),
}

impl TaskChange {
    pub fn task(&self) -> &MaintenanceTask {
        match self {
            TaskChange::Opened(t) | TaskChange::Superseded(t) | TaskChange::Closed(t) => t,
        }
    }
}

#[derive(Debug, Clone)]
struct ComponentProfile {
    weight: f64,
    /// RUL warning horizon, for the remaining-life margin term
    warning_hours: Option<f64>,
}

/// Per-asset aggregator of alert transitions and RUL estimates
#[derive(Debug)]
pub struct Aggregator {
    asset: AssetId,
    profiles: BTreeMap<ComponentId, ComponentProfile>,
    weights: HealthWeights,
    leads: MaintenanceConfig,
    open: HashMap<ComponentId, MaintenanceTask>,
    /// Superseded and closed tasks, newest last
    history: VecDeque<MaintenanceTask>,
    latest_rul: HashMap<ComponentId, f64>,
    changes: Vec<TaskChange>,
    seq: u64,
}

impl Aggregator {
    pub fn new(
        asset: AssetId,
        components: &[ComponentConfig],
        weights: HealthWeights,
        leads: MaintenanceConfig,
    ) -> Self {
        let profiles = components
            .iter()
            .map(|c| {
                let warning_hours = match &c.policy {
                    AlertPolicy::Rul(p) => Some(p.warning_hours),
                    AlertPolicy::Anomaly(_) => None,
                };
                (
                    c.name.clone(),
                    ComponentProfile {
                        weight: c.weight,
                        warning_hours,
                    },
                )
            })
            .collect();
        Self {
            asset,
            profiles,
            weights,
            leads,
            open: HashMap::new(),
            history: VecDeque::new(),
            latest_rul: HashMap::new(),
            changes: Vec::new(),
            seq: 0,
        }
    }

    /// Remember the latest RUL estimate of a component
    pub fn record_rul(&mut self, component: &ComponentId, hours: f64) {
        self.latest_rul.insert(component.clone(), hours);
    }

    pub fn latest_rul(&self, component: &ComponentId) -> Option<f64> {
        self.latest_rul.get(component).copied()
    }

    /// Health in [0, 1] where 1 is fully healthy
    ///
    /// Per component: weighted blend of the alert severity score and, for RUL
    /// components with an estimate, the remaining-life margin relative to the
    /// warning horizon. Components combine by their configured weights.
    pub fn asset_health(&self, alerts: &AlertStateMachine) -> f64 {
        let (mut total, mut weight_sum) = (0.0, 0.0);
        for (component, profile) in &self.profiles {
            let score = self.component_health(component, profile, alerts.level(component));
            total += profile.weight * score;
            weight_sum += profile.weight;
        }
        if weight_sum > 0.0 {
            (total / weight_sum).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    /// Health of one component in [0, 1]
    pub fn health_of(&self, component: &ComponentId, level: AlertLevel) -> f64 {
        self.profiles
            .get(component)
            .map_or(level.severity_score(), |p| {
                self.component_health(component, p, level)
            })
            .clamp(0.0, 1.0)
    }

    fn component_health(
        &self,
        component: &ComponentId,
        profile: &ComponentProfile,
        level: AlertLevel,
    ) -> f64 {
        let severity = level.severity_score();
        let margin = match (profile.warning_hours, self.latest_rul.get(component)) {
            (Some(horizon), Some(rul)) if horizon > 0.0 => (rul / horizon).clamp(0.0, 1.0),
            _ => return severity,
        };
        let (sw, rw) = (self.weights.severity_weight, self.weights.rul_margin_weight);
        if sw + rw <= 0.0 {
            return severity;
        }
        ((sw * severity + rw * margin) / (sw + rw)).clamp(0.0, 1.0)
    }

    pub fn open_task(&self, component: &ComponentId) -> Option<&MaintenanceTask> {
        self.open.get(component)
    }

    /// Open tasks followed by history, ordered by generation time
    pub fn tasks(&self) -> Vec<MaintenanceTask> {
        let mut tasks: Vec<MaintenanceTask> = self
            .open
            .values()
            .chain(self.history.iter())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.generated_at.cmp(&b.generated_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Task changes since the last drain
    pub fn drain_changes(&mut self) -> Vec<TaskChange> {
        std::mem::take(&mut self.changes)
    }

    fn due_by(&self, level: AlertLevel, at: Timestamp) -> Timestamp {
        let lead_hours = match level {
            AlertLevel::Critical => self.leads.critical_lead_hours,
            _ => self.leads.warning_lead_hours,
        };
        at.saturating_add((lead_hours * MILLIS_PER_HOUR).round() as i64)
    }

    fn new_task(&mut self, t: &AlertTransition) -> MaintenanceTask {
        self.seq += 1;
        MaintenanceTask {
            id: format!("{}-{}-{}", self.asset, t.component, self.seq),
            asset: self.asset.clone(),
            component: t.component.clone(),
            due_by: self.due_by(t.to, t.at),
            reason: t.trigger,
            severity: t.to,
            generated_at: t.at,
            status: TaskStatus::Open,
            closed_at: None,
            superseded_by: None,
        }
    }

    fn archive(&mut self, task: MaintenanceTask) {
        self.history.push_back(task);
        while self.history.len() > self.leads.history_capacity {
            self.history.pop_front();
        }
    }
}

impl AlertListener for Aggregator {
    fn on_alert_change(&mut self, t: &AlertTransition) {
        match (t.from, t.to) {
            (_, AlertLevel::Normal) => {
                if let Some(mut task) = self.open.remove(&t.component) {
                    task.status = TaskStatus::Closed;
                    task.closed_at = Some(t.at);
                    self.changes.push(TaskChange::Closed(task.clone()));
                    self.archive(task);
                }
            }
            (AlertLevel::Warning, AlertLevel::Critical) if self.open.contains_key(&t.component) => {
                let replacement = self.new_task(t);
                if let Some(mut old) = self.open.remove(&t.component) {
                    old.status = TaskStatus::Superseded;
                    old.closed_at = Some(t.at);
                    old.superseded_by = Some(replacement.id.clone());
                    self.changes.push(TaskChange::Superseded(old.clone()));
                    self.archive(old);
                }
                self.changes.push(TaskChange::Opened(replacement.clone()));
                self.open.insert(t.component.clone(), replacement);
            }
            (_, to) if to.is_alerting() => {
                // de-escalation keeps the more urgent task already open
                if !self.open.contains_key(&t.component) {
                    let task = self.new_task(t);
                    self.changes.push(TaskChange::Opened(task.clone()));
                    self.open.insert(t.component.clone(), task);
                }
            }
            _ => {}
        }
    }
}

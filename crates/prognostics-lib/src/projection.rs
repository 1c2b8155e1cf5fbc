//! Read-only query projections over per-asset pipeline state
//!
//! Each asset's unit is the only writer of its own entry; readers get
//! cloned snapshots and never block a unit for longer than a map lookup.

use crate::models::{
    AlertLevel, AlertTransition, AssetId, ComponentId, MaintenanceTask, TaskStatus, Timestamp,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Alert level and health of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentView {
    pub component: ComponentId,
    pub level: AlertLevel,
    pub entered_at: Timestamp,
    pub health: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_rul_hours: Option<f64>,
}

/// Current health of one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetHealth {
    pub asset_id: AssetId,
    /// Aggregate health score in [0, 1]
    pub health: f64,
    /// End of the last window that was fully processed
    pub as_of: Timestamp,
    /// Wall-clock time of the last update (epoch millis)
    pub updated_at: i64,
    pub components: Vec<ComponentView>,
    pub open_tasks: usize,
}

/// Everything a unit publishes after processing one window
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub health: f64,
    pub window_end: Timestamp,
    pub components: Vec<ComponentView>,
    pub transitions: Vec<AlertTransition>,
    pub tasks: Vec<MaintenanceTask>,
}

#[derive(Debug, Clone)]
struct AssetEntry {
    health: AssetHealth,
    alerts: VecDeque<AlertTransition>,
    tasks: Vec<MaintenanceTask>,
}

/// Fleet-wide projection keyed by asset
#[derive(Debug)]
pub struct FleetView {
    assets: DashMap<AssetId, AssetEntry>,
    alert_feed_capacity: usize,
}

impl FleetView {
    pub fn new(alert_feed_capacity: usize) -> Self {
        Self {
            assets: DashMap::new(),
            alert_feed_capacity,
        }
    }

    /// Replace an asset's snapshot and append its new transitions to the feed
    pub fn publish(&self, asset: &AssetId, update: SnapshotUpdate) {
        let open_tasks = update.tasks.iter().filter(|t| t.is_open()).count();
        let health = AssetHealth {
            asset_id: asset.clone(),
            health: update.health,
            as_of: update.window_end,
            updated_at: chrono::Utc::now().timestamp_millis(),
            components: update.components,
            open_tasks,
        };

        let mut entry = self
            .assets
            .entry(asset.clone())
            .or_insert_with(|| AssetEntry {
                health: health.clone(),
                alerts: VecDeque::new(),
                tasks: Vec::new(),
            });
        entry.health = health;
        entry.tasks = update.tasks;
        entry.alerts.extend(update.transitions);
        while entry.alerts.len() > self.alert_feed_capacity {
            entry.alerts.pop_front();
        }
    }

    pub fn current_health(&self, asset: &AssetId) -> Option<AssetHealth> {
        self.assets.get(asset).map(|e| e.health.clone())
    }

    /// Transitions at or after `since`, merged across assets in time order
    pub fn alert_feed(&self, since: Option<Timestamp>) -> Vec<AlertTransition> {
        let since = since.unwrap_or(Timestamp::MIN);
        let mut feed: Vec<AlertTransition> = self
            .assets
            .iter()
            .flat_map(|e| {
                e.alerts
                    .iter()
                    .filter(|t| t.at >= since)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        feed.sort_by(|a, b| {
            a.at.cmp(&b.at)
                .then_with(|| a.asset.cmp(&b.asset))
                .then_with(|| a.component.cmp(&b.component))
        });
        feed
    }

    /// Tasks filtered by asset and status, oldest first
    pub fn maintenance_tasks(
        &self,
        asset: Option<&AssetId>,
        status: Option<TaskStatus>,
    ) -> Vec<MaintenanceTask> {
        let keep = |t: &&MaintenanceTask| status.map_or(true, |s| t.status == s);
        let mut tasks: Vec<MaintenanceTask> = match asset {
            Some(asset) => self
                .assets
                .get(asset)
                .map(|e| e.tasks.iter().filter(keep).cloned().collect())
                .unwrap_or_default(),
            None => self
                .assets
                .iter()
                .flat_map(|e| e.tasks.iter().filter(keep).cloned().collect::<Vec<_>>())
                .collect(),
        };
        tasks.sort_by(|a, b| {
            a.generated_at
                .cmp(&b.generated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    pub fn assets(&self) -> Vec<AssetId> {
        let mut ids: Vec<AssetId> = self.assets.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictionKind;

    fn transition(asset: &str, at: Timestamp) -> AlertTransition {
        AlertTransition {
            asset: AssetId::from(asset),
            component: ComponentId::from("brakes"),
            from: AlertLevel::Normal,
            to: AlertLevel::Warning,
            at,
            trigger: PredictionKind::Anomaly,
            value: 0.8,
        }
    }

    fn task(asset: &str, seq: u32, at: Timestamp, status: TaskStatus) -> MaintenanceTask {
        MaintenanceTask {
            id: format!("{asset}-brakes-{seq}"),
            asset: AssetId::from(asset),
            component: ComponentId::from("brakes"),
            due_by: at + 1_000,
            reason: PredictionKind::Anomaly,
            severity: AlertLevel::Warning,
            generated_at: at,
            status,
            closed_at: None,
            superseded_by: None,
        }
    }

    fn update(transitions: Vec<AlertTransition>, tasks: Vec<MaintenanceTask>) -> SnapshotUpdate {
        SnapshotUpdate {
            health: 0.75,
            window_end: 60_000,
            components: vec![],
            transitions,
            tasks,
        }
    }

    #[test]
    fn test_current_health() {
        let view = FleetView::new(10);
        let asset = AssetId::from("truck-1");
        assert!(view.current_health(&asset).is_none());

        view.publish(&asset, update(vec![], vec![task("truck-1", 1, 5, TaskStatus::Open)]));
        let health = view.current_health(&asset).unwrap();
        assert_eq!(health.health, 0.75);
        assert_eq!(health.as_of, 60_000);
        assert_eq!(health.open_tasks, 1);
        assert!(health.updated_at > 0);
    }

    #[test]
    fn test_alert_feed_merges_in_time_order() {
        let view = FleetView::new(10);
        view.publish(
            &AssetId::from("truck-2"),
            update(vec![transition("truck-2", 300), transition("truck-2", 100)], vec![]),
        );
        view.publish(&AssetId::from("truck-1"), update(vec![transition("truck-1", 200)], vec![]));

        let feed: Vec<_> = view.alert_feed(None).iter().map(|t| t.at).collect();
        assert_eq!(feed, vec![100, 200, 300]);
        let recent: Vec<_> = view.alert_feed(Some(200)).iter().map(|t| t.at).collect();
        assert_eq!(recent, vec![200, 300]);
    }

    #[test]
    fn test_alert_feed_is_bounded_per_asset() {
        let view = FleetView::new(2);
        let asset = AssetId::from("truck-1");
        for at in 0..5 {
            view.publish(&asset, update(vec![transition("truck-1", at)], vec![]));
        }
        let feed: Vec<_> = view.alert_feed(None).iter().map(|t| t.at).collect();
        assert_eq!(feed, vec![3, 4]);
    }

    #[test]
    fn test_task_filters() {
        let view = FleetView::new(10);
        view.publish(
            &AssetId::from("truck-1"),
            update(
                vec![],
                vec![
                    task("truck-1", 1, 10, TaskStatus::Closed),
                    task("truck-1", 2, 30, TaskStatus::Open),
                ],
            ),
        );
        view.publish(
            &AssetId::from("truck-2"),
            update(vec![], vec![task("truck-2", 1, 20, TaskStatus::Open)]),
        );

        let all: Vec<_> = view
            .maintenance_tasks(None, None)
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(all, vec!["truck-1-brakes-1", "truck-2-brakes-1", "truck-1-brakes-2"]);

        let open = view.maintenance_tasks(None, Some(TaskStatus::Open));
        assert_eq!(open.len(), 2);

        let truck1_closed =
            view.maintenance_tasks(Some(&AssetId::from("truck-1")), Some(TaskStatus::Closed));
        assert_eq!(truck1_closed.len(), 1);
        assert!(view
            .maintenance_tasks(Some(&AssetId::from("truck-9")), None)
            .is_empty());
        assert_eq!(view.assets().len(), 2);
    }
}

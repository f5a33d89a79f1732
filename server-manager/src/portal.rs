use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{ManagerError, Result};
use crate::types::{Portal, PortalShape, PortalView};

const TRIGGER_RADIUS: f64 = 3.0;
const TRIGGER_HEIGHT: i32 = 2;

/// Fields accepted when creating a portal; the id is generated.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPortal {
    pub name: String,
    pub server_id: Uuid,
    pub target_server_id: Uuid,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub world: String,
    #[serde(default)]
    pub shape: PortalShape,
    #[serde(default)]
    pub x2: Option<i32>,
    #[serde(default)]
    pub z2: Option<i32>,
}

/// Partial update. Name and owning server cannot be changed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalUpdate {
    pub target_server_id: Option<Uuid>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub z: Option<i32>,
    pub world: Option<String>,
    pub shape: Option<PortalShape>,
    pub x2: Option<i32>,
    pub z2: Option<i32>,
}

impl Portal {
    /// Whether a player at the given block position stands in the trigger zone.
    pub fn contains(&self, world: &str, x: f64, y: f64, z: f64) -> bool {
        if self.world != world {
            return false;
        }
        let dx = x - f64::from(self.x);
        let dy = y - f64::from(self.y);
        let dz = z - f64::from(self.z);
        let within_height = dy.abs() <= f64::from(TRIGGER_HEIGHT);

        match self.shape {
            PortalShape::Sphere => (dx * dx + dy * dy + dz * dz).sqrt() <= TRIGGER_RADIUS,
            PortalShape::Flat => within_height && (dx * dx + dz * dz).sqrt() <= TRIGGER_RADIUS,
            PortalShape::Rectangle => {
                let x2 = f64::from(self.x2.unwrap_or(self.x));
                let z2 = f64::from(self.z2.unwrap_or(self.z));
                let (x1, z1) = (f64::from(self.x), f64::from(self.z));
                within_height
                    && x >= x1.min(x2)
                    && x <= x1.max(x2)
                    && z >= z1.min(z2)
                    && z <= z1.max(z2)
            }
        }
    }
}

/// In-memory portal bookkeeping. Portals do not survive a restart.
#[derive(Default)]
pub struct PortalRegistry {
    portals: RwLock<HashMap<Uuid, Portal>>,
}

impl PortalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, new: NewPortal) -> Portal {
        let portal = Portal {
            id: Uuid::new_v4(),
            name: new.name,
            server_id: new.server_id,
            target_server_id: new.target_server_id,
            x: new.x,
            y: new.y,
            z: new.z,
            world: new.world,
            shape: new.shape,
            x2: new.x2,
            z2: new.z2,
        };
        self.write().insert(portal.id, portal.clone());
        portal
    }

    pub fn update(&self, id: Uuid, update: PortalUpdate) -> Result<Portal> {
        let mut portals = self.write();
        let portal = portals.get_mut(&id).ok_or(ManagerError::NotFound(id))?;

        if let Some(target) = update.target_server_id {
            portal.target_server_id = target;
        }
        if let Some(x) = update.x {
            portal.x = x;
        }
        if let Some(y) = update.y {
            portal.y = y;
        }
        if let Some(z) = update.z {
            portal.z = z;
        }
        if let Some(world) = update.world {
            portal.world = world;
        }
        if let Some(shape) = update.shape {
            portal.shape = shape;
        }
        if update.x2.is_some() {
            portal.x2 = update.x2;
        }
        if update.z2.is_some() {
            portal.z2 = update.z2;
        }
        Ok(portal.clone())
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.write()
            .remove(&id)
            .map(|_| ())
            .ok_or(ManagerError::NotFound(id))
    }

    /// Drops every portal owned by `server_id`.
    pub fn remove_owned_by(&self, server_id: Uuid) {
        self.write().retain(|_, p| p.server_id != server_id);
    }

    /// Lists portals, optionally only those owned by `server_id`. The target
    /// name is looked up through `server_name` on every call.
    pub fn list<F>(&self, server_id: Option<Uuid>, server_name: F) -> Vec<PortalView>
    where
        F: Fn(&Uuid) -> Option<String>,
    {
        let portals = self.portals.read().unwrap_or_else(|e| e.into_inner());
        let mut views: Vec<PortalView> = portals
            .values()
            .filter(|p| server_id.map_or(true, |owner| p.server_id == owner))
            .map(|p| PortalView {
                target_server_name: server_name(&p.target_server_id).unwrap_or_else(|| "Unknown".to_string()),
                portal: p.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.portal.name.cmp(&b.portal.name));
        views
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Portal>> {
        self.portals.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_portal(owner: Uuid, target: Uuid, shape: PortalShape) -> NewPortal {
        NewPortal {
            name: "To Survival".to_string(),
            server_id: owner,
            target_server_id: target,
            x: 0,
            y: 64,
            z: 0,
            world: "world".to_string(),
            shape,
            x2: None,
            z2: None,
        }
    }

    #[test]
    fn list_filters_by_owner_and_resolves_names() {
        let registry = PortalRegistry::new();
        let (hub, survival, creative) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        registry.create(new_portal(hub, survival, PortalShape::Flat));
        registry.create(new_portal(creative, Uuid::new_v4(), PortalShape::Flat));

        let names = |id: &Uuid| (*id == survival).then(|| "Survival".to_string());

        let hub_portals = registry.list(Some(hub), names);
        assert_eq!(hub_portals.len(), 1);
        assert_eq!(hub_portals[0].target_server_name, "Survival");

        let all = registry.list(None, names);
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|v| v.target_server_name == "Unknown"));
    }

    #[test]
    fn update_patches_only_given_fields() {
        let registry = PortalRegistry::new();
        let portal = registry.create(new_portal(Uuid::new_v4(), Uuid::new_v4(), PortalShape::Flat));

        let updated = registry
            .update(
                portal.id,
                PortalUpdate {
                    x: Some(10),
                    shape: Some(PortalShape::Sphere),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.x, 10);
        assert_eq!(updated.y, 64);
        assert_eq!(updated.shape, PortalShape::Sphere);
        assert_eq!(updated.name, portal.name);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = PortalRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(registry.update(id, PortalUpdate::default()), Err(ManagerError::NotFound(_))));
        assert!(matches!(registry.delete(id), Err(ManagerError::NotFound(_))));
    }

    #[test]
    fn delete_and_owner_purge() {
        let registry = PortalRegistry::new();
        let owner = Uuid::new_v4();
        let a = registry.create(new_portal(owner, Uuid::new_v4(), PortalShape::Flat));
        registry.create(new_portal(owner, Uuid::new_v4(), PortalShape::Flat));
        registry.create(new_portal(Uuid::new_v4(), owner, PortalShape::Flat));

        registry.delete(a.id).unwrap();
        assert_eq!(registry.list(None, |_| None).len(), 2);

        registry.remove_owned_by(owner);
        assert_eq!(registry.list(None, |_| None).len(), 1);
    }

    #[test]
    fn trigger_zones() {
        let registry = PortalRegistry::new();
        let owner = Uuid::new_v4();

        let sphere = registry.create(new_portal(owner, owner, PortalShape::Sphere));
        assert!(sphere.contains("world", 1.0, 65.0, 1.0));
        assert!(!sphere.contains("world", 2.0, 66.0, 2.0));
        assert!(!sphere.contains("world_nether", 0.0, 64.0, 0.0));

        let flat = registry.create(new_portal(owner, owner, PortalShape::Flat));
        assert!(flat.contains("world", 2.0, 66.0, 2.0));
        assert!(!flat.contains("world", 0.0, 67.0, 0.0));

        let mut rect = new_portal(owner, owner, PortalShape::Rectangle);
        rect.x2 = Some(-10);
        rect.z2 = Some(5);
        let rect = registry.create(rect);
        assert!(rect.contains("world", -7.5, 63.0, 4.0));
        assert!(!rect.contains("world", 1.0, 64.0, 4.0));
        assert!(!rect.contains("world", -5.0, 70.0, 2.0));
    }
}

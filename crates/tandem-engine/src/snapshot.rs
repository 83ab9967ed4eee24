use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::ledger::ParamLedger;
use crate::patch::PatchPlan;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Plan plus the parameter state sent on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub plan: PatchPlan,
    pub params: ParamLedger,
}

impl EngineSnapshot {
    pub fn new(plan: PatchPlan, params: ParamLedger) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            plan,
            params,
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(text)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        snapshot.plan.validate()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Ident, Value};

    #[test]
    fn save_and_load() {
        let mut params = ParamLedger::new();
        params.record(&CommandKind::SetParam {
            module: Ident::new("flt").expect("ident"),
            param: Ident::new("cutoff").expect("ident"),
            value: Value::Float(900.0),
        });
        let snapshot = EngineSnapshot::new(PatchPlan::classic(330.0), params);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        snapshot.save(&path).expect("save");
        assert_eq!(EngineSnapshot::load(&path).expect("load"), snapshot);
    }

    #[test]
    fn rejects_other_versions() {
        let mut snapshot = EngineSnapshot::new(PatchPlan::classic(330.0), ParamLedger::new());
        snapshot.version = 7;
        let json = serde_json::to_string(&snapshot).expect("json");
        assert!(matches!(
            EngineSnapshot::from_json(&json),
            Err(SnapshotError::Version { found: 7, .. })
        ));
    }
}

use anyhow::Context;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};
use viewsync::{Replica, ReplicaSchema, SchemaConfig};

/// Load the replica snapshot, starting empty when there is none or it
/// cannot be read. Tables the schema no longer publishes are dropped.
pub fn load_replica(path: &Path, schema: &ReplicaSchema) -> Replica {
    if path.exists() {
        info!("Loading replica snapshot from {:?}", path);
        match fs::read(path) {
            Ok(bytes) => match cbor4ii::serde::from_slice::<Replica>(&bytes) {
                Ok(mut replica) => {
                    replica.retain_published(schema);
                    info!(
                        version = ?replica.version(),
                        rows = replica.row_count(),
                        "Loaded replica snapshot"
                    );
                    return replica;
                }
                Err(e) => error!("Failed to decode replica snapshot: {}", e),
            },
            Err(e) => error!("Failed to read replica snapshot: {}", e),
        }
    } else {
        info!("No replica snapshot at {:?}, starting empty", path);
    }
    Replica::new()
}

pub fn save_replica(path: &Path, replica: &Replica) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create replica directory")?;
    }

    let bytes = cbor4ii::serde::to_vec(Vec::new(), replica)
        .map_err(|e| anyhow::anyhow!("Failed to encode replica: {e}"))?;
    // Write then rename so a crash never leaves a torn snapshot.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes).context("Failed to write replica snapshot")?;
    fs::rename(&tmp, path).context("Failed to move replica snapshot into place")?;
    info!(bytes = bytes.len(), "Saved replica snapshot to {:?}", path);
    Ok(())
}

/// Read the schema file. Without one, only the client metadata table is
/// replicated.
pub fn load_schema(path: Option<&Path>, clients_table: &str) -> anyhow::Result<ReplicaSchema> {
    let config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema file {:?}", path))?;
            serde_json::from_str::<SchemaConfig>(&content)
                .with_context(|| format!("Invalid schema file {:?}", path))?
        }
        None => {
            warn!("VIEWSYNC_SCHEMA_FILE not set, serving the client metadata table only");
            serde_json::from_str::<SchemaConfig>(r#"{"tables": {}}"#).context("Empty schema")?
        }
    };
    ReplicaSchema::from_config(config, clients_table).context("Invalid schema")
}

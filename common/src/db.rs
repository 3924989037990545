use error_stack::ResultExt;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::{
    core::NodeInfo,
    error::{Result, WatcherError},
};

const SHARED_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS public.blocks (
    key  TEXT PRIMARY KEY,
    data BYTEA NOT NULL
);
CREATE TABLE IF NOT EXISTS public.nodes (
    id            SERIAL PRIMARY KEY,
    node_id       TEXT NOT NULL,
    client_name   TEXT NOT NULL,
    genesis_block TEXT NOT NULL,
    network_id    TEXT NOT NULL,
    UNIQUE (node_id, genesis_block, network_id)
);
"#;

/// Connects and spawns the connection driver task.
pub async fn connect(conn_string: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(conn_string, NoTls)
        .await
        .change_context(WatcherError::Configuration)
        .attach_printable("failed to connect to postgres")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(err = ?err, "postgres connection error");
        }
    });
    Ok(client)
}

/// Applies the shared tables and upserts this watcher's chain-node identity,
/// returning the row id that scopes all index rows.
pub async fn register_node(client: &Client, info: &NodeInfo) -> Result<i32> {
    client
        .batch_execute(SHARED_SCHEMA)
        .await
        .change_context(WatcherError::Configuration)
        .attach_printable("failed to apply shared schema")?;
    let row = client
        .query_one(
            "INSERT INTO public.nodes (node_id, client_name, genesis_block, network_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (node_id, genesis_block, network_id)
             DO UPDATE SET client_name = EXCLUDED.client_name
             RETURNING id",
            &[
                &info.node_id,
                &info.client_name,
                &info.genesis_block,
                &info.network_id,
            ],
        )
        .await
        .change_context(WatcherError::Configuration)
        .attach_printable("failed to register chain node identity")?;
    let id: i32 = row.get(0);
    info!(node_db_id = id, node_id = %info.node_id, "registered chain node");
    Ok(id)
}

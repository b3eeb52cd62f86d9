//! HAProxy command handlers for in-process workers. They apply config
//! changes to the fleet registry's config records; rendering and pushing
//! the actual HAProxy files happens on the target and is not done here.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use super::runner::HandlerRegistry;
use crate::lib::fleet::registry::FleetRegistry;
use crate::lib::fleet::types::HaproxyConfig;
use crate::lib::tasks::types::{
    Command, CreateConfigParams, HaproxyCommand, RemoveConfigParams, Task, UpdateConfigParams,
};

pub fn register_haproxy_handlers(registry: &HandlerRegistry, fleet: Arc<dyn FleetRegistry>) {
    let create_fleet = fleet.clone();
    registry.register(Command::Haproxy(HaproxyCommand::CreateConfig), move |task: Task| {
        let fleet = create_fleet.clone();
        async move {
            let params: CreateConfigParams =
                serde_json::from_value(task.params).context("malformed create-config params")?;
            let config = HaproxyConfig {
                id: uuid::Uuid::new_v4().to_string(),
                target_id: task.target_id,
                name: params.name.trim().to_string(),
                content: params.content.trim().to_string(),
                kind: params.kind,
                order_num: params.order,
                status: "active".to_string(),
            };
            let id = config.id.clone();
            fleet.upsert_haproxy_config(config);
            tracing::info!("Created HAProxy config {}", id);
            Ok::<_, anyhow::Error>(json!({ "config_id": id }))
        }
    });

    let update_fleet = fleet.clone();
    registry.register(Command::Haproxy(HaproxyCommand::UpdateConfig), move |task: Task| {
        let fleet = update_fleet.clone();
        async move {
            let params: UpdateConfigParams =
                serde_json::from_value(task.params).context("malformed update-config params")?;
            let mut config = fleet.get_haproxy_config(&params.id)?;
            if let Some(name) = params.name {
                config.name = name.trim().to_string();
            }
            if let Some(content) = params.content {
                config.content = content.trim().to_string();
            }
            if let Some(order) = params.order_number {
                config.order_num = Some(order);
            }
            fleet.upsert_haproxy_config(config);
            tracing::info!("Updated HAProxy config {}", params.id);
            Ok::<_, anyhow::Error>(json!({ "config_id": params.id }))
        }
    });

    registry.register(Command::Haproxy(HaproxyCommand::RemoveConfig), move |task: Task| {
        let fleet = fleet.clone();
        async move {
            let params: RemoveConfigParams =
                serde_json::from_value(task.params).context("malformed remove-config params")?;
            let removed = fleet.remove_haproxy_config(&params.id)?;
            tracing::info!("Removed HAProxy config {} ({})", removed.name, removed.id);
            Ok::<_, anyhow::Error>(json!({ "config_id": removed.id }))
        }
    });
}

//! Message routing.
//!
//! Maps each `(channel, command)` pair from a registered client onto a store
//! operation or a relay. Replies go straight to the sender; every state
//! change reaches the other clients through change propagation.

use super::Engine;
use crate::adapters::{Channel, ClientKey, Command, Envelope};
use crate::core::error::{SyncError, SyncResult};
use crate::store::{ClientKind, EntityId, EntityKind, Origin, NO_ID};
use serde_json::{json, Map, Value};

/// Entity id carried by a payload: a number, a numeric string or an object
/// with an `id` field.
pub(crate) fn payload_id(payload: &Value) -> Option<EntityId> {
    match payload {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(fields) => fields.get("id").and_then(payload_id),
        _ => None,
    }
}

fn payload_fields(payload: Value) -> SyncResult<Map<String, Value>> {
    match payload {
        Value::Object(fields) => Ok(fields),
        Value::Null => Ok(Map::new()),
        other => Err(SyncError::invalid_request(format!(
            "expected an object payload, got {other}"
        ))),
    }
}

fn entity_kind(channel: Channel) -> Option<EntityKind> {
    match channel {
        Channel::Plot => Some(EntityKind::Plot),
        Channel::Link => Some(EntityKind::Link),
        Channel::Filter => Some(EntityKind::Filter),
        Channel::WebClient | Channel::ArClient => Some(EntityKind::Client),
        _ => None,
    }
}

impl Engine {
    /// Route one message from a registered client.
    pub(super) async fn route(&mut self, from: &ClientKey, envelope: Envelope) {
        let (Some(channel), Some(command)) = (
            Channel::from_id(envelope.channel),
            Command::parse(&envelope.command),
        ) else {
            tracing::warn!(
                client = %from,
                channel = envelope.channel,
                command = %envelope.command,
                "dropping unroutable message"
            );
            return;
        };
        if let Err(e) = self.dispatch(from, channel, command, envelope.payload).await {
            tracing::warn!(client = %from, ?channel, command = command.as_str(), error = %e, "request failed");
        }
    }

    async fn dispatch(
        &mut self,
        from: &ClientKey,
        channel: Channel,
        command: Command,
        payload: Value,
    ) -> SyncResult<()> {
        let origin = self.sessions.get(from).copied();
        match (channel, command) {
            (Channel::Registration, _) => {
                tracing::debug!(client = %from, "ignoring repeated registration");
            }

            (Channel::Plot | Channel::Link | Channel::Filter, Command::Request) => {
                self.send_snapshot(from, channel, None);
            }
            (Channel::Plot | Channel::Link | Channel::Filter, Command::Add) => {
                let mut fields = payload_fields(payload)?;
                if channel == Channel::Link {
                    claim_unfinished_link(&mut fields, origin);
                }
                self.create(channel, fields, origin).await;
            }
            (Channel::Plot | Channel::Link | Channel::Filter, Command::Update) => {
                let id = payload_id(&payload)
                    .ok_or_else(|| SyncError::invalid_request("update without id"))?;
                self.patch(channel, id, &payload_fields(payload)?, origin)?;
            }
            (Channel::Plot | Channel::Link | Channel::Filter, Command::Remove) => {
                let id = payload_id(&payload)
                    .ok_or_else(|| SyncError::invalid_request("remove without id"))?;
                self.remove(channel, id, origin).await?;
            }

            (Channel::Color, Command::Request) => {
                for table in self.colors.tables() {
                    let envelope = Envelope::new(Channel::Color, Command::Update, table.to_wire());
                    self.gateway.send(from, envelope);
                }
            }

            (Channel::WebClient | Channel::ArClient, Command::Request) => {
                let kind = match channel {
                    Channel::WebClient => ClientKind::Web,
                    _ => ClientKind::Ar,
                };
                self.send_snapshot(from, channel, Some(kind));
            }
            (Channel::WebClient | Channel::ArClient, Command::Update) => {
                let id = match payload_id(&payload) {
                    Some(id) => id,
                    None => origin.ok_or(SyncError::ClientNotConnected {
                        client: from.to_string(),
                    })?,
                };
                self.patch(channel, id, &payload_fields(payload)?, origin)?;
            }

            (Channel::Control, Command::Cmd) => {
                let line = match &payload {
                    Value::String(line) => line.clone(),
                    Value::Object(fields) => fields
                        .get("command")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| SyncError::invalid_request("control command without text"))?,
                    _ => return Err(SyncError::invalid_request("control command without text")),
                };
                let output = self.run_admin(super::admin::AdminCommand::parse(&line)?).await?;
                if let Some(output) = output {
                    let reply = Envelope::new(Channel::Log, Command::Cmd, json!(output));
                    self.gateway.send(from, reply);
                }
            }
            (Channel::Control, Command::Action) => {
                let envelope = Envelope::new(Channel::Control, Command::Action, payload);
                let relayed = self.gateway.broadcast(&envelope, |key| key != from);
                tracing::debug!(client = %from, relayed, "menu action relayed");
            }

            (Channel::Voice, Command::Update) => {
                let active = match &payload {
                    Value::Bool(active) => *active,
                    Value::Object(fields) => fields
                        .get("isVoiceActive")
                        .and_then(Value::as_bool)
                        .ok_or_else(|| SyncError::invalid_request("voice update without state"))?,
                    _ => return Err(SyncError::invalid_request("voice update without state")),
                };
                let id = origin.ok_or(SyncError::ClientNotConnected {
                    client: from.to_string(),
                })?;
                self.stores
                    .clients
                    .edit(id, origin, |c| c.set_voice_active(active));
            }
            (Channel::Voice, Command::Cmd) => {
                let envelope = Envelope::new(Channel::Voice, Command::Cmd, payload);
                let relayed = self
                    .gateway
                    .broadcast(&envelope, |key| key.kind == ClientKind::Ar && key != from);
                tracing::debug!(client = %from, relayed, "voice command relayed");
            }

            (Channel::Log, _) => {
                tracing::info!(client = %from, message = %payload, "client log");
            }
            (Channel::InteractionLog, _) => {
                tracing::info!(target: "interaction", client = %from, event = %payload);
            }

            (channel, command) => {
                return Err(SyncError::invalid_request(format!(
                    "unsupported command {} on {channel:?}",
                    command.as_str()
                )));
            }
        }
        Ok(())
    }

    fn send_snapshot(&self, to: &ClientKey, channel: Channel, client_kind: Option<ClientKind>) {
        let Some(kind) = entity_kind(channel) else {
            return;
        };
        let items: Vec<Value> = match client_kind {
            Some(client_kind) => self
                .stores
                .clients
                .iter()
                .filter(|c| c.kind() == client_kind)
                .map(|c| Value::Object(crate::store::Entity::to_fields(c)))
                .collect(),
            None => self.stores.snapshot(kind),
        };
        self.gateway
            .send(to, Envelope::new(channel, Command::Request, Value::Array(items)));
    }

    async fn create(&mut self, channel: Channel, fields: Map<String, Value>, origin: Origin) {
        let id = match channel {
            Channel::Plot => self.stores.plots.create(fields, origin).await,
            Channel::Link => self.stores.links.create(fields, origin).await,
            Channel::Filter => self.stores.filters.create(fields, origin).await,
            _ => return,
        };
        tracing::debug!(?channel, id, "entity added by client");
    }

    fn patch(
        &mut self,
        channel: Channel,
        id: EntityId,
        fields: &Map<String, Value>,
        origin: Origin,
    ) -> SyncResult<()> {
        let changed = match entity_kind(channel) {
            Some(EntityKind::Plot) => self.stores.plots.apply_patch(id, origin, fields)?,
            Some(EntityKind::Link) => self.stores.links.apply_patch(id, origin, fields)?,
            Some(EntityKind::Filter) => self.stores.filters.apply_patch(id, origin, fields)?,
            Some(EntityKind::Client) => self.stores.clients.apply_patch(id, origin, fields)?,
            None => return Ok(()),
        };
        tracing::trace!(?channel, id, ?changed, "patch applied");
        Ok(())
    }

    async fn remove(&mut self, channel: Channel, id: EntityId, origin: Origin) -> SyncResult<()> {
        let (kind, removed) = match channel {
            Channel::Plot => (
                EntityKind::Plot,
                self.stores.plots.delete(id, origin).await.is_some(),
            ),
            Channel::Link => (
                EntityKind::Link,
                self.stores.links.delete(id, origin).await.is_some(),
            ),
            Channel::Filter => (
                EntityKind::Filter,
                self.stores.filters.delete(id, origin).await.is_some(),
            ),
            _ => return Ok(()),
        };
        if removed {
            Ok(())
        } else {
            Err(SyncError::EntityNotFound {
                kind: kind.as_str(),
                id,
            })
        }
    }
}

/// A link added with a missing endpoint is still being drawn: it belongs to
/// the client drawing it until finalized.
fn claim_unfinished_link(fields: &mut Map<String, Value>, origin: Origin) {
    let Some(owner) = origin else {
        return;
    };
    let open = ["upstream", "downstream"].iter().any(|end| {
        fields
            .get(*end)
            .and_then(Value::as_i64)
            .map_or(true, |id| id <= 0 || id == NO_ID)
    });
    if open && !fields.contains_key("createdBy") {
        fields.insert("createdBy".into(), json!(owner));
    }
}

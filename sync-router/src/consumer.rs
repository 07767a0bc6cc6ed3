use crate::command::SessionCommand;
use crate::router::Effect;
use crate::session::SyncSession;
use anyhow::Result;
use sync_connection::{ConnectionManager, ConnectionStatus};
use sync_core::{SocialApi, SyncContext};
use tokio::sync::mpsc;

/// Owns the session of the context's user. Inbound frames and local
/// commands are applied serially until a logout command arrives or the
/// connection manager goes away.
pub async fn run(
    ctx: SyncContext,
    connection: ConnectionManager,
    mut commands: mpsc::Receiver<SessionCommand>,
) -> Result<()> {
    tracing::info!("Starting sync consumer for {}", ctx.user_id);

    let mut events = connection.on_event()?;
    let mut status = connection.status();
    let mut session = SyncSession::new(&ctx.user_id, &ctx.config);
    let api = ctx.api.as_ref();

    resync(&mut session, api).await;

    let mut commands_open = true;
    loop {
        tokio::select! {
            frame = events.recv() => {
                let Some(raw) = frame else {
                    tracing::info!("Event channel closed");
                    break;
                };
                let effects = session.handle_frame(&raw);
                for effect in &effects {
                    log_effect(effect);
                }
                for effect in session.apply_effects(api, effects).await {
                    log_effect(&effect);
                }
            }
            command = commands.recv(), if commands_open => {
                match command {
                    Some(command) => {
                        if !command.execute(&mut session, api, &connection).await {
                            tracing::info!("Logout requested");
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("All session handles dropped");
                        commands_open = false;
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                tracing::info!("Connection status: {:?}", current);
                if current == ConnectionStatus::Offline {
                    tracing::warn!("Connection offline, waiting for a new connect");
                }
            }
        }
    }

    session.logout();
    Ok(())
}

async fn resync(session: &mut SyncSession, api: &dyn SocialApi) {
    match session.refresh_all(api).await {
        Ok(outcomes) => {
            for outcome in outcomes {
                log_effect(&Effect::RelationshipChanged(outcome));
            }
        }
        Err(e) => tracing::error!("Friend list resync failed: {}", e),
    }
    match session.load_notifications(api).await {
        Ok(count) => tracing::debug!("Loaded {} notification(s)", count),
        Err(e) => tracing::error!("Notification resync failed: {}", e),
    }
}

fn log_effect(effect: &Effect) {
    match effect {
        Effect::RelationshipChanged(outcome) => tracing::info!(
            "Relationship with {} is now {}",
            outcome.counterparty,
            outcome.current
        ),
        Effect::Notified(item) => tracing::info!("[{}] {}", item.kind, item.message),
        Effect::GroupJoined(group_id) => tracing::info!("Joined group {}", group_id),
        Effect::ServerError(text) => tracing::warn!("Server error: {}", text),
        Effect::MessageStored {
            chat_id,
            message_id,
            outcome,
        } => tracing::debug!("Message {} in {}: {:?}", message_id, chat_id, outcome),
        Effect::Refresh(kind, user_id) => tracing::debug!("Refresh {:?} for {}", kind, user_id),
        Effect::RefreshNotifications(user_id) => tracing::debug!("Refresh notifications for {}", user_id),
        Effect::Connected(user) => tracing::debug!("Server acknowledged connection for {:?}", user),
    }
}

use anyhow::{bail, Result};
use sync_core::{private_chat_id, temp_chat_id, MessageTarget};
use sync_router::SessionHandle;

pub const HELP: &str = "\
commands:
  request|accept|reject|cancel|remove <user>
  like|unlike <user>
  say <user> <text>          group <group> <text>
  history <user>             group-history <group>
  chat <user|group>          delete-message <id>
  friends                    requests
  notifications              read <id> | read-all
  delete-notification <id>   clear
  help                       quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Request(String),
    Accept(String),
    Reject(String),
    Cancel(String),
    Remove(String),
    Like(String),
    Unlike(String),
    Say { to: String, text: String },
    GroupSay { group: String, text: String },
    History(String),
    GroupHistory(String),
    Chat(String),
    DeleteMessage(String),
    Friends,
    Requests,
    Notifications,
    Read(String),
    ReadAll,
    DeleteNotification(String),
    Clear,
    Help,
    Quit,
}

/// Parses one input line; blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let arg = |name: &str| -> Result<String> {
        match rest.split_whitespace().next() {
            Some(value) => Ok(value.to_string()),
            None => bail!("{} needs an argument", name),
        }
    };
    let arg_and_text = |name: &str| -> Result<(String, String)> {
        match rest.split_once(char::is_whitespace) {
            Some((target, text)) if !text.trim().is_empty() => Ok((target.to_string(), text.trim().to_string())),
            _ => bail!("{} needs a target and some text", name),
        }
    };

    let input = match command {
        "request" => Input::Request(arg(command)?),
        "accept" => Input::Accept(arg(command)?),
        "reject" => Input::Reject(arg(command)?),
        "cancel" => Input::Cancel(arg(command)?),
        "remove" => Input::Remove(arg(command)?),
        "like" => Input::Like(arg(command)?),
        "unlike" => Input::Unlike(arg(command)?),
        "say" => {
            let (to, text) = arg_and_text(command)?;
            Input::Say { to, text }
        }
        "group" => {
            let (group, text) = arg_and_text(command)?;
            Input::GroupSay { group, text }
        }
        "history" => Input::History(arg(command)?),
        "group-history" => Input::GroupHistory(arg(command)?),
        "chat" => Input::Chat(arg(command)?),
        "delete-message" => Input::DeleteMessage(arg(command)?),
        "friends" => Input::Friends,
        "requests" => Input::Requests,
        "notifications" => Input::Notifications,
        "read" => Input::Read(arg(command)?),
        "read-all" => Input::ReadAll,
        "delete-notification" => Input::DeleteNotification(arg(command)?),
        "clear" => Input::Clear,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => bail!("unknown command: {}", other),
    };
    Ok(Some(input))
}

/// Runs one input against the session. Returns false on quit.
pub async fn dispatch(handle: &SessionHandle, me: &str, input: Input) -> Result<bool> {
    match input {
        Input::Request(user) => handle.send_friend_request(&user).await?,
        Input::Accept(user) => handle.accept_friend_request(&user).await?,
        Input::Reject(user) => handle.reject_friend_request(&user).await?,
        Input::Cancel(user) => handle.cancel_friend_request(&user).await?,
        Input::Remove(user) => handle.remove_friend(&user).await?,
        Input::Like(user) => handle.like_profile(&user).await?,
        Input::Unlike(user) => handle.unlike_profile(&user).await?,
        Input::Say { to, text } => {
            let message = handle.send_message(MessageTarget::User(to), &text).await?;
            println!("sent {} in {}", message.id, message.chat_id);
        }
        Input::GroupSay { group, text } => {
            let message = handle.send_message(MessageTarget::Group(group), &text).await?;
            println!("sent {} in {}", message.id, message.chat_id);
        }
        Input::History(user) => {
            let merged = handle.load_private_history(&user).await?;
            println!("{} message(s) loaded", merged);
        }
        Input::GroupHistory(group) => {
            let merged = handle.load_group_history(&group).await?;
            println!("{} message(s) loaded", merged);
        }
        Input::Chat(other) => {
            let mut messages = handle.chat(&private_chat_id(me, &other)).await?;
            if messages.is_empty() {
                messages = handle.chat(&temp_chat_id(&other)).await?;
            }
            if messages.is_empty() {
                messages = handle.chat(&other).await?;
            }
            for message in messages {
                let marker = if message.provisional { "~" } else { " " };
                println!("{}{} {}: {}", marker, message.timestamp.format("%H:%M"), message.from_user_id, message.content);
            }
        }
        Input::DeleteMessage(id) => handle.delete_message(&id).await?,
        Input::Friends => {
            for friend in handle.friends().await? {
                println!("{} ({})", friend.display_name(), friend.id);
            }
        }
        Input::Requests => {
            for request in handle.received_requests().await? {
                println!("from {} ({})", request.display_name(), request.id);
            }
            for request in handle.sent_requests().await? {
                println!("to {} ({})", request.display_name(), request.id);
            }
        }
        Input::Notifications => {
            for item in handle.notifications().await? {
                let marker = if item.is_read { " " } else { "*" };
                println!("{}{} [{}] {}", marker, item.id, item.kind, item.message);
            }
        }
        Input::Read(id) => handle.mark_notification_read(&id).await?,
        Input::ReadAll => {
            let marked = handle.mark_all_notifications_read().await?;
            println!("{} notification(s) marked read", marked);
        }
        Input::DeleteNotification(id) => handle.delete_notification(&id).await?,
        Input::Clear => {
            if let Err(failed) = handle.clear_notifications().await? {
                tracing::warn!("Clear failed on the server ({}), fetching once more", failed.error);
                handle.run_effects(vec![failed.retry]).await?;
            }
        }
        Input::Help => println!("{}", HELP),
        Input::Quit => return Ok(false),
    }
    Ok(true)
}

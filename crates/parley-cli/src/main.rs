//! # parley
//!
//! Terminal chat client on top of `parley-client`.
//!
//! Lines typed on stdin are posted to the current room; lines starting with
//! `/` are commands (`/help` lists them). The client carries no media, so
//! incoming calls are declined.

use std::sync::Arc;

use parley_client::{ClientConfig, HttpResourceApi, Session, WebSocketTransport};
use parley_media::NoMedia;
use parley_shared::constants::APP_NAME;
use parley_shared::protocol::{now_millis, Event, EventKind};
use parley_shared::types::{RoomId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const HELP: &str = "\
/join <room>     switch to a room
/leave           leave the current room
/invite <user>   invite a user to the current room
/mark            mark the current room as read
/roster          show the roster
/add <user>      add a user to the roster
/remove <user>   remove a user from the roster
/quit            disconnect and exit";

enum Input<'a> {
    Say(&'a str),
    Join(RoomId),
    Leave,
    Invite(UserId),
    Mark,
    Roster,
    Add(UserId),
    Remove(UserId),
    Help,
    Quit,
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Input::Say(line));
        };

        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        match (name, arg) {
            ("join", Some(room)) => Some(Input::Join(RoomId::from(room))),
            ("leave", _) => Some(Input::Leave),
            ("invite", Some(user)) => Some(Input::Invite(UserId::from(user))),
            ("mark", _) => Some(Input::Mark),
            ("roster", _) => Some(Input::Roster),
            ("add", Some(user)) => Some(Input::Add(UserId::from(user))),
            ("remove", Some(user)) => Some(Input::Remove(UserId::from(user))),
            ("quit", _) => Some(Input::Quit),
            _ => Some(Input::Help),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_client::init_tracing();
    info!("Starting {} terminal client v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(
        server = %config.server_url,
        api = %config.api_url,
        user = %config.session_id,
        "Loaded configuration"
    );

    let mut room = std::env::args()
        .nth(1)
        .map(RoomId::from)
        .unwrap_or_else(|| RoomId::from("general"));

    let api = Arc::new(HttpResourceApi::new(&config));
    let session = Session::new(config, Arc::new(WebSocketTransport), Arc::new(NoMedia), api);

    session.on_connect(|hello| info!(device = %hello.device_id, "Server said hello"));
    session.on_disconnect(|d| warn!(reason = %d.reason, "Disconnected"));
    session.on_error(|e| warn!(reason = %e.reason, "Server error"));
    session.on_event(EventKind::ChatMessage, |event| {
        if let Event::ChatMessage(m) = event {
            println!("[{}] {}: {}", m.room, m.sender, m.body);
        }
    });
    session.on_room_invitation(|invite| {
        println!("{} invited you to {} (/join {})", invite.inviter(), invite.room(), invite.room());
    });
    session.on_call_invitation(|incoming| {
        println!("{} is calling, declining (no media here)", incoming.inviter());
        tokio::spawn(async move {
            if let Err(e) = incoming.reject().await {
                warn!(call = %incoming.id(), error = %e, "Failed to decline call");
            }
        });
    });

    session.connect().await?;
    session.join_room(&room).await?;
    println!("In {room}. Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let Some(input) = Input::parse(&line) else {
            continue;
        };

        let result = match input {
            Input::Say(body) => {
                let session = session.clone();
                let target = room.clone();
                let body = body.to_string();
                tokio::spawn(async move {
                    if let Err(e) = session.send_message(&target, body).await {
                        println!("! message to {target} failed: {e}");
                    }
                });
                Ok(())
            }
            Input::Join(next) => {
                let joined = session.join_room(&next).await;
                if joined.is_ok() {
                    room = next;
                    println!("In {room}.");
                }
                joined.map(|_| ())
            }
            Input::Leave => session.leave_room(&room).await,
            Input::Invite(user) => session.invite_to_room(&room, &user).await,
            Input::Mark => session.mark(&room, now_millis()).await,
            Input::Roster => session.roster().await.map(|entries| {
                for entry in entries {
                    println!("  {} ({:?})", entry.user, entry.status);
                }
            }),
            Input::Add(user) => session.add_to_roster(&user).await,
            Input::Remove(user) => session.remove_from_roster(&user).await,
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Quit => break,
        };

        if let Err(e) = result {
            println!("! {e}");
        }
    }

    session.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert!(Input::parse("   ").is_none());
        assert!(matches!(Input::parse("hello there"), Some(Input::Say("hello there"))));
        assert!(matches!(Input::parse("/join r2"), Some(Input::Join(r)) if r.as_str() == "r2"));
        assert!(matches!(Input::parse("/join"), Some(Input::Help)));
        assert!(matches!(Input::parse("/quit"), Some(Input::Quit)));
    }
}

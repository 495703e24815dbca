//! The command shell users reach when they connect to the BBS.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use tokio::sync::{Mutex, RwLock};

use packet_bbs_core::Callsign;
use packet_bbs_radio::{Application, DisconnectReason, Response, SessionContext, SessionKey};

const PROMPT: &str = "> ";
const MAIL_PROMPT: &str = "mail> ";
/// Characters of a bulletin shown by `list`.
const SUMMARY_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Mail,
}

#[derive(Debug, Clone)]
struct Bulletin {
    from: Callsign,
    text: String,
}

pub struct CommandShell {
    banner: String,
    modes: Mutex<HashMap<SessionKey, Mode>>,
    bulletins: RwLock<Vec<Bulletin>>,
}

impl CommandShell {
    pub fn new(banner: impl Into<String>) -> Self {
        Self {
            banner: banner.into(),
            modes: Mutex::new(HashMap::new()),
            bulletins: RwLock::new(Vec::new()),
        }
    }

    pub async fn bulletin_count(&self) -> usize {
        self.bulletins.read().await.len()
    }

    async fn command(&self, key: &SessionKey, line: &str) -> Response {
        let (word, rest) = split_command(line);
        match word.as_str() {
            "" => reply(PROMPT),
            "help" | "?" => reply(format!("Commands: help, mail, bye\r\n{}", PROMPT)),
            "mail" => {
                self.modes.lock().await.insert(key.clone(), Mode::Mail);
                reply(format!("Launching Mail\r\n{}", MAIL_PROMPT))
            }
            "bye" | "b" => Response::ReplyAndDisconnect(Bytes::from_static(b"73!\r\n")),
            _ => {
                debug!("{} unknown command {:?} {:?}", key, word, rest);
                reply(format!("Unknown command: {}\r\n{}", word, PROMPT))
            }
        }
    }

    async fn mail(&self, key: &SessionKey, line: &str) -> Response {
        let (word, rest) = split_command(line);
        match word.as_str() {
            "" => reply(MAIL_PROMPT),
            "help" | "?" => reply(format!(
                "Mail commands: list, read N, post TEXT, quit\r\n{}",
                MAIL_PROMPT
            )),
            "list" | "l" => {
                let bulletins = self.bulletins.read().await;
                let mut out = String::new();
                if bulletins.is_empty() {
                    out.push_str("No bulletins\r\n");
                }
                for (i, b) in bulletins.iter().enumerate() {
                    let summary: String = b.text.chars().take(SUMMARY_LEN).collect();
                    out.push_str(&format!("{:>3} {:<9} {}\r\n", i + 1, b.from.to_string(), summary));
                }
                out.push_str(MAIL_PROMPT);
                reply(out)
            }
            "read" | "r" => {
                let bulletins = self.bulletins.read().await;
                let found = rest
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| bulletins.get(i));
                match found {
                    Some(b) => reply(format!("From: {}\r\n{}\r\n{}", b.from, b.text, MAIL_PROMPT)),
                    None => reply(format!("No bulletin {}\r\n{}", rest, MAIL_PROMPT)),
                }
            }
            "post" | "p" => {
                if rest.is_empty() {
                    return reply(format!("Usage: post TEXT\r\n{}", MAIL_PROMPT));
                }
                let mut bulletins = self.bulletins.write().await;
                bulletins.push(Bulletin {
                    from: key.remote,
                    text: rest.to_string(),
                });
                info!("{} posted bulletin {}", key.remote, bulletins.len());
                reply(format!("Bulletin {} posted\r\n{}", bulletins.len(), MAIL_PROMPT))
            }
            "quit" | "q" => {
                self.modes.lock().await.insert(key.clone(), Mode::Command);
                reply(PROMPT)
            }
            "bye" | "b" => Response::ReplyAndDisconnect(Bytes::from_static(b"73!\r\n")),
            _ => reply(format!("Unknown mail command: {}\r\n{}", word, MAIL_PROMPT)),
        }
    }
}

#[async_trait]
impl Application for CommandShell {
    fn name(&self) -> &str {
        "shell"
    }

    async fn on_connected(&self, ctx: &SessionContext) -> Response {
        if ctx.originated {
            return Response::Nothing;
        }
        self.modes.lock().await.insert(ctx.key.clone(), Mode::Command);
        reply(format!("{}\r\n{}", self.banner, PROMPT))
    }

    async fn handle_received_message(&self, ctx: &SessionContext, payload: Bytes) -> Response {
        let text = String::from_utf8_lossy(&payload);
        let line = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        let mode = self
            .modes
            .lock()
            .await
            .get(&ctx.key)
            .copied()
            .unwrap_or(Mode::Command);
        match mode {
            Mode::Command => self.command(&ctx.key, line).await,
            Mode::Mail => self.mail(&ctx.key, line).await,
        }
    }

    async fn on_disconnect(&self, ctx: &SessionContext, reason: DisconnectReason) {
        debug!("{} left the shell: {}", ctx.key, reason);
        self.modes.lock().await.remove(&ctx.key);
    }
}

fn reply(text: impl Into<String>) -> Response {
    Response::Reply(Bytes::from(text.into()))
}

/// Lower-cased first word and the trimmed remainder.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word.to_ascii_lowercase(), rest.trim()),
        None => (line.to_ascii_lowercase(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_bbs_core::ProtocolId;
    use packet_bbs_radio::ChannelId;

    fn ctx(remote: &str) -> SessionContext {
        SessionContext {
            key: SessionKey::new(
                ChannelId::new("vhf"),
                "BBS".parse().unwrap(),
                remote.parse().unwrap(),
            ),
            pid: ProtocolId::Text,
            originated: false,
        }
    }

    async fn say(shell: &CommandShell, ctx: &SessionContext, line: &str) -> String {
        match shell
            .handle_received_message(ctx, Bytes::from(format!("{}\r", line)))
            .await
        {
            Response::Reply(b) => String::from_utf8(b.to_vec()).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_greets_with_banner_and_prompt() {
        let shell = CommandShell::new("N0CALL BBS");
        let user = ctx("N0CALL-1");
        assert_eq!(
            shell.on_connected(&user).await,
            Response::Reply(Bytes::from_static(b"N0CALL BBS\r\n> "))
        );

        let mut originated = ctx("N0CALL-2");
        originated.originated = true;
        assert_eq!(shell.on_connected(&originated).await, Response::Nothing);
    }

    #[tokio::test]
    async fn test_mail_mode_posts_lists_and_reads() {
        let shell = CommandShell::new("hi");
        let user = ctx("N0CALL-1");
        shell.on_connected(&user).await;

        assert_eq!(say(&shell, &user, "MAIL").await, "Launching Mail\r\nmail> ");
        assert_eq!(say(&shell, &user, "list").await, "No bulletins\r\nmail> ");
        assert_eq!(
            say(&shell, &user, "post Net tonight at 2000").await,
            "Bulletin 1 posted\r\nmail> "
        );
        assert!(say(&shell, &user, "list").await.contains("N0CALL-1"));
        assert_eq!(
            say(&shell, &user, "read 1").await,
            "From: N0CALL-1\r\nNet tonight at 2000\r\nmail> "
        );
        assert_eq!(say(&shell, &user, "read 7").await, "No bulletin 7\r\nmail> ");
        assert_eq!(say(&shell, &user, "quit").await, "> ");
        assert_eq!(shell.bulletin_count().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_have_their_own_mode() {
        let shell = CommandShell::new("hi");
        let first = ctx("N0CALL-1");
        let second = ctx("N0CALL-2");
        say(&shell, &first, "mail").await;
        assert_eq!(say(&shell, &second, "list").await, "Unknown command: list\r\n> ");
        assert_eq!(say(&shell, &first, "list").await, "No bulletins\r\nmail> ");

        shell.on_disconnect(&first, DisconnectReason::Remote).await;
        assert!(say(&shell, &first, "list").await.starts_with("Unknown command"));
    }

    #[tokio::test]
    async fn test_bye_disconnects_after_reply() {
        let shell = CommandShell::new("hi");
        let user = ctx("N0CALL-1");
        assert_eq!(
            shell.handle_received_message(&user, Bytes::from_static(b"bye\r")).await,
            Response::ReplyAndDisconnect(Bytes::from_static(b"73!\r\n"))
        );
    }

    #[test]
    fn test_splits_commands() {
        assert_eq!(split_command("  Post hello world "), ("post".to_string(), "hello world"));
        assert_eq!(split_command("LIST"), ("list".to_string(), ""));
    }
}

//! Named terminal sessions backed by real PTYs.
//!
//! Each session owns a reader thread that appends output chunks to a
//! cursor-addressable log. Sequence numbers are strictly monotonic per
//! session, so a client polling with `get_logs(cursor)` always receives the
//! exact suffix it has not yet seen. Sessions outlive process exit; their
//! logs stay readable until an explicit `kill`.

use std::{
    collections::HashMap,
    io::Read,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::bus::interface::{TerminalCommandPayload, TerminalLogChunk, TerminalLogsPayload};

#[derive(Debug, Clone)]
pub enum PtyEvent {
    SessionCreated {
        session_id: String,
    },
    Data {
        session_id: String,
    },
    Exit {
        session_id: String,
        exit_code: Option<u32>,
        signal: Option<String>,
    },
}

pub type PtyEventListener = Arc<dyn Fn(PtyEvent) + Send + Sync>;

struct SessionLog {
    entries: Vec<(u64, Vec<u8>)>,
    next_seq: u64,
}

struct TerminalSession {
    master: Box<dyn MasterPty + Send>,
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    log: Arc<Mutex<SessionLog>>,
    exited: Arc<Mutex<bool>>,
}

pub struct PtyManager {
    sessions: Arc<Mutex<HashMap<String, TerminalSession>>>,
    listener: PtyEventListener,
    working_directory: PathBuf,
}

impl PtyManager {
    pub fn new(working_directory: PathBuf, listener: PtyEventListener) -> Self {
        PtyManager {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            listener,
            working_directory,
        }
    }

    /// Spawns a shell in a fresh PTY and returns the new session id.
    pub fn create_session(
        &self,
        shell: Option<&str>,
        args: &[String],
        cols: u16,
        rows: u16,
        env: &HashMap<String, String>,
    ) -> Result<String, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Pty {
                message: err.to_string(),
            })?;

        let shell = shell.map(str::to_owned).unwrap_or_else(default_shell);
        let mut cmd = CommandBuilder::new(&shell);
        cmd.args(args);
        cmd.cwd(&self.working_directory);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|err| PtyError::Pty {
            message: err.to_string(),
        })?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| PtyError::Pty {
                message: err.to_string(),
            })?;
        let writer = pair.master.take_writer().map_err(|err| PtyError::Pty {
            message: err.to_string(),
        })?;
        let killer = child.clone_killer();

        let session_id = uuid::Uuid::new_v4().to_string();
        let log = Arc::new(Mutex::new(SessionLog {
            entries: Vec::new(),
            next_seq: 1,
        }));
        let exited = Arc::new(Mutex::new(false));

        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            TerminalSession {
                master: pair.master,
                writer: Mutex::new(writer),
                killer,
                log: Arc::clone(&log),
                exited: Arc::clone(&exited),
            },
        );

        spawn_reader_thread(session_id.clone(), reader, log, Arc::clone(&self.listener));

        // Waiter thread: emits the exit event once the shell dies. The
        // session entry stays behind so logs remain poll-able.
        let listener = Arc::clone(&self.listener);
        let waiter_id = session_id.clone();
        thread::Builder::new()
            .name(format!("pty-wait-{}", waiter_id))
            .spawn(move || {
                let status = child.wait();
                *exited.lock().unwrap() = true;

                let exit_code = status.as_ref().ok().map(|status| status.exit_code());
                (listener.as_ref())(PtyEvent::Exit {
                    session_id: waiter_id,
                    exit_code,
                    signal: None,
                });
            })
            .expect("Could not start PTY waiter thread");

        log::debug!("Created terminal session {} running {}", session_id, shell);
        (self.listener.as_ref())(PtyEvent::SessionCreated {
            session_id: session_id.clone(),
        });

        Ok(session_id)
    }

    /// Returns log entries with `seq > cursor` and the new high-water mark.
    pub fn get_logs(&self, session_id: &str, cursor: u64) -> Option<TerminalLogsPayload> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(session_id)?;
        let log = session.log.lock().unwrap();

        let logs: Vec<TerminalLogChunk> = log
            .entries
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .map(|(seq, bytes)| TerminalLogChunk {
                seq: *seq,
                data: String::from_utf8_lossy(bytes).into_owned(),
            })
            .collect();

        Some(TerminalLogsPayload {
            session_id: session_id.to_owned(),
            cursor: log.next_seq - 1,
            logs,
        })
    }

    pub fn write_input(&self, session_id: &str, input: &str) -> Result<(), PtyError> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| PtyError::UnknownSession {
                session_id: session_id.to_owned(),
            })?;

        let mut writer = session.writer.lock().unwrap();
        writer.write_all(input.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), PtyError> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| PtyError::UnknownSession {
                session_id: session_id.to_owned(),
            })?;

        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Pty {
                message: err.to_string(),
            })
    }

    /// Kills the process (if still running) and forgets the session and its
    /// logs.
    pub fn kill(&self, session_id: &str) -> Result<(), PtyError> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut session = sessions
            .remove(session_id)
            .ok_or_else(|| PtyError::UnknownSession {
                session_id: session_id.to_owned(),
            })?;

        if !*session.exited.lock().unwrap() {
            if let Err(err) = session.killer.kill() {
                log::warn!("Failed to kill terminal session {}: {}", session_id, err);
            }
        }

        log::debug!("Removed terminal session {}", session_id);
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Tears down every live session; used during shutdown.
    pub fn kill_all(&self) {
        let ids = self.session_ids();
        for id in ids {
            let _ = self.kill(&id);
        }
    }

    /// Runs a command under the user's shell and resolves with its combined
    /// output once it exits, successful or not.
    pub async fn run_one_off_command(&self, command: &str) -> TerminalCommandPayload {
        let mut cmd = one_off_command(command);
        cmd.current_dir(&self.working_directory);

        match cmd.output().await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                TerminalCommandPayload {
                    output: text,
                    exit_code: output.status.code(),
                }
            }
            Err(err) => TerminalCommandPayload {
                output: format!("Failed to run command: {}", err),
                exit_code: None,
            },
        }
    }
}

fn spawn_reader_thread(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    log: Arc<Mutex<SessionLog>>,
    listener: PtyEventListener,
) {
    thread::Builder::new()
        .name(format!("pty-read-{}", session_id))
        .spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        {
                            let mut log = log.lock().unwrap();
                            let seq = log.next_seq;
                            log.next_seq += 1;
                            log.entries.push((seq, chunk[..n].to_vec()));
                        }
                        (listener.as_ref())(PtyEvent::Data {
                            session_id: session_id.clone(),
                        });
                    }
                }
            }
        })
        .expect("Could not start PTY reader thread");
}

#[cfg(unix)]
fn default_shell() -> String {
    if std::path::Path::new("/bin/zsh").exists() {
        "/bin/zsh".to_owned()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned())
    }
}

#[cfg(windows)]
fn default_shell() -> String {
    "cmd.exe".to_owned()
}

#[cfg(unix)]
fn one_off_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(default_shell());
    cmd.arg("-lc").arg(command);
    cmd
}

#[cfg(windows)]
fn one_off_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd.exe");
    cmd.arg("/C").arg(command);
    cmd
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("Unknown terminal session {session_id}")]
    UnknownSession { session_id: String },

    #[error("PTY error: {message}")]
    Pty { message: String },

    #[error(transparent)]
    Io {
        #[from]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn manager_with_events() -> (PtyManager, Arc<Mutex<Vec<String>>>) {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_handle = Arc::clone(&events);
        let listener: PtyEventListener = Arc::new(move |event| {
            let label = match event {
                PtyEvent::SessionCreated { .. } => "created",
                PtyEvent::Data { .. } => "data",
                PtyEvent::Exit { .. } => "exit",
            };
            events_handle.lock().unwrap().push(label.to_owned());
        });
        let dir = std::env::temp_dir();
        (PtyManager::new(dir, listener), events)
    }

    #[test]
    #[cfg(unix)]
    fn session_logs_are_monotonic_and_cursor_addressable() {
        let (manager, events) = manager_with_events();

        let session_id = manager
            .create_session(
                Some("/bin/sh"),
                &["-c".to_owned(), "printf 'hello-from-pty'".to_owned()],
                80,
                24,
                &HashMap::new(),
            )
            .unwrap();

        // Wait for the shell to produce output and exit.
        let mut waited = 0;
        while waited < 5000 {
            if events.lock().unwrap().iter().any(|label| label == "exit") {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
            waited += 50;
        }

        let all = manager.get_logs(&session_id, 0).unwrap();
        assert!(!all.logs.is_empty());
        let combined: String = all.logs.iter().map(|chunk| chunk.data.as_str()).collect();
        assert!(combined.contains("hello-from-pty"));

        let seqs: Vec<u64> = all.logs.iter().map(|chunk| chunk.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert_eq!(all.cursor, *seqs.last().unwrap());

        // Polling from the high-water mark returns nothing new.
        let tail = manager.get_logs(&session_id, all.cursor).unwrap();
        assert!(tail.logs.is_empty());

        // Logs survive exit until kill.
        manager.kill(&session_id).unwrap();
        assert!(manager.get_logs(&session_id, 0).is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn one_off_commands_resolve_regardless_of_exit_code() {
        let (manager, _) = manager_with_events();

        let ok = manager.run_one_off_command("printf one-off-out").await;
        assert_eq!(ok.exit_code, Some(0));
        assert!(ok.output.contains("one-off-out"));

        let failed = manager.run_one_off_command("exit 3").await;
        assert_eq!(failed.exit_code, Some(3));
    }
}

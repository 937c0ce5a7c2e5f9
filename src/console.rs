//! Line-oriented control console
//!
//! Parses one command per line and runs it against the arbitrator and
//! discovery. Output is returned as text so the binary decides where it goes.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapters::wiim_discovery::DeviceDiscovery;
use crate::arbitrator::SourceArbitrator;
use crate::bus::ArbitrationMode;

pub const HELP: &str = "\
commands:
  status              show the active source and what it is playing
  play                toggle play/pause
  next | prev         skip forward / back
  seek <secs>         jump to a position
  vol <0-100>         set volume
  mute [on|off]       set or toggle mute
  mode [auto|remote|local]
  eq list | eq load <name>
  presets | preset <n>
  discover | devices | use <n>
  help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    PlayPause,
    Next,
    Previous,
    Seek(u32),
    Volume(i32),
    /// `None` toggles
    Mute(Option<bool>),
    /// `None` shows the current mode
    Mode(Option<ArbitrationMode>),
    EqList,
    EqLoad(String),
    Presets,
    Preset(u32),
    Discover,
    Devices,
    /// 1-based index into the last discovery result
    Use(usize),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0} (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        fn number<T: FromStr>(rest: &str, usage: &'static str) -> Result<T, ParseError> {
            rest.parse().map_err(|_| ParseError::Usage(usage))
        }

        match word.to_lowercase().as_str() {
            "" => Err(ParseError::Empty),
            "status" | "s" => Ok(Self::Status),
            "play" | "pause" | "p" => Ok(Self::PlayPause),
            "next" | "n" => Ok(Self::Next),
            "prev" | "previous" => Ok(Self::Previous),
            "seek" => number(rest, "seek <secs>").map(Self::Seek),
            "vol" | "volume" => number(rest, "vol <0-100>").map(Self::Volume),
            "mute" => match rest.to_lowercase().as_str() {
                "" => Ok(Self::Mute(None)),
                "on" => Ok(Self::Mute(Some(true))),
                "off" => Ok(Self::Mute(Some(false))),
                _ => Err(ParseError::Usage("mute [on|off]")),
            },
            "mode" if rest.is_empty() => Ok(Self::Mode(None)),
            "mode" => rest
                .parse()
                .map(|mode| Self::Mode(Some(mode)))
                .map_err(|_| ParseError::Usage("mode [auto|remote|local]")),
            "eq" => match rest.split_once(char::is_whitespace) {
                Some(("load", name)) if !name.trim().is_empty() => {
                    Ok(Self::EqLoad(name.trim().to_string()))
                }
                None if rest == "list" || rest.is_empty() => Ok(Self::EqList),
                _ => Err(ParseError::Usage("eq list | eq load <name>")),
            },
            "presets" => Ok(Self::Presets),
            "preset" => number(rest, "preset <n>").map(Self::Preset),
            "discover" => Ok(Self::Discover),
            "devices" => Ok(Self::Devices),
            "use" => number(rest, "use <n>").map(Self::Use),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Quit,
}

fn format_clock(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub struct Console {
    arbitrator: Arc<SourceArbitrator>,
    discovery: Arc<DeviceDiscovery>,
}

impl Console {
    pub fn new(arbitrator: Arc<SourceArbitrator>, discovery: Arc<DeviceDiscovery>) -> Self {
        Self {
            arbitrator,
            discovery,
        }
    }

    /// Parse and run one line
    pub async fn handle_line(&self, line: &str) -> Outcome {
        match line.parse::<ConsoleCommand>() {
            Ok(command) => self.execute(command).await,
            Err(ParseError::Empty) => Outcome::Continue(String::new()),
            Err(e) => Outcome::Continue(e.to_string()),
        }
    }

    /// `handle_line` that gives up once `shutdown` fires. `None` if it did.
    pub async fn handle_line_until(
        &self,
        line: &str,
        shutdown: &CancellationToken,
    ) -> Option<Outcome> {
        tokio::select! {
            _ = shutdown.cancelled() => None,
            outcome = self.handle_line(line) => Some(outcome),
        }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Outcome {
        let arb = &self.arbitrator;
        let result = match command {
            ConsoleCommand::Quit => return Outcome::Quit,
            ConsoleCommand::Help => Ok(HELP.to_string()),
            ConsoleCommand::Status => Ok(self.status().await),
            ConsoleCommand::PlayPause => arb.toggle_play_pause().await.map(|_| "ok".to_string()),
            ConsoleCommand::Next => arb.next().await.map(|_| "ok".to_string()),
            ConsoleCommand::Previous => arb.previous().await.map(|_| "ok".to_string()),
            ConsoleCommand::Seek(secs) => arb
                .seek(secs)
                .await
                .map(|_| format!("seek {}", format_clock(Duration::from_secs(u64::from(secs))))),
            ConsoleCommand::Volume(level) => arb
                .set_volume(level)
                .await
                .map(|_| format!("volume {}", level.clamp(0, 100))),
            ConsoleCommand::Mute(Some(muted)) => arb
                .set_mute(muted)
                .await
                .map(|_| (if muted { "muted" } else { "unmuted" }).to_string()),
            ConsoleCommand::Mute(None) => arb.toggle_mute().await.map(|_| "ok".to_string()),
            ConsoleCommand::Mode(None) => {
                let mode = arb.mode().await;
                Ok(format!("mode {} ({})", mode, mode.description()))
            }
            ConsoleCommand::Mode(Some(mode)) => {
                arb.set_mode(mode).await;
                Ok(format!("mode {}", mode))
            }
            ConsoleCommand::EqList => {
                let current = arb.current_eq().await;
                let list = arb.eq_presets().await;
                if list.is_empty() {
                    Ok("no EQ presets".to_string())
                } else {
                    Ok(list
                        .iter()
                        .map(|name| {
                            let marker = if current.as_deref() == Some(name.as_str()) {
                                "*"
                            } else {
                                " "
                            };
                            format!("{} {}", marker, name)
                        })
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
            }
            ConsoleCommand::EqLoad(name) => arb
                .load_eq_preset(&name)
                .await
                .map(|_| format!("EQ {}", name)),
            ConsoleCommand::Presets => {
                let presets = arb.presets().await;
                if presets.is_empty() {
                    Ok("no presets".to_string())
                } else {
                    Ok(presets
                        .iter()
                        .map(|p| format!("{:>2}  {}", p.number, p.display_name()))
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
            }
            ConsoleCommand::Preset(number) => arb
                .play_preset(number)
                .await
                .map(|_| format!("preset {}", number)),
            ConsoleCommand::Discover => {
                return Outcome::Continue(match self.discovery.discover().await {
                    Ok(devices) => format_devices(&devices),
                    Err(e) => format!("discovery failed: {}", e),
                })
            }
            ConsoleCommand::Devices => Ok(format_devices(&self.discovery.devices().await)),
            ConsoleCommand::Use(index) => {
                let devices = self.discovery.devices().await;
                let Some(device) = index.checked_sub(1).and_then(|i| devices.get(i)) else {
                    return Outcome::Continue(format!(
                        "no device {} (run `discover` first)",
                        index
                    ));
                };
                arb.remote().configure_device(device).await;
                Ok(format!("using {} ({})", device.display_name(), device.host))
            }
        };

        Outcome::Continue(result.unwrap_or_else(|e| format!("error: {}", e)))
    }

    async fn status(&self) -> String {
        let arb = &self.arbitrator;
        let mode = arb.mode().await;
        let state = arb.current_state().await;
        let snapshot = &state.snapshot;

        let mut out = format!("[{}] mode {}", state.identifier, mode);
        if !state.available {
            out.push_str(" (unavailable)");
        }
        if snapshot.has_metadata() {
            let icon = if snapshot.playing { ">" } else { "||" };
            let _ = write!(out, "\n  {} {} - {}", icon, snapshot.title, snapshot.artist);
            if !snapshot.album.is_empty() {
                let _ = write!(out, " ({})", snapshot.album);
            }
            if !snapshot.duration.is_zero() {
                let _ = write!(
                    out,
                    "  {}/{}",
                    format_clock(snapshot.position),
                    format_clock(snapshot.duration)
                );
            }
        } else {
            out.push_str("\n  nothing playing");
        }
        let _ = write!(
            out,
            "\n  volume {}{}",
            state.extras.volume,
            if state.extras.muted { " (muted)" } else { "" }
        );
        out
    }
}

fn format_devices(devices: &[crate::adapters::wiim_discovery::Device]) -> String {
    if devices.is_empty() {
        return "no devices found".to_string();
    }
    devices
        .iter()
        .enumerate()
        .map(|(i, d)| format!("{:>2}  {} ({})", i + 1, d.display_name(), d.host))
        .collect::<Vec<_>>()
        .join("\n")
}

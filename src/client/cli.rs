use anyhow::{anyhow, bail};

pub const USAGE: &str = "commands: PLAY <video> <port> | STOP | QUIT";

/// One line of interactive client input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Play { video: String, port: u16 },
    Stop,
    Quit,
}

impl CliCommand {
    /// Parses a line of user input. Keywords are case insensitive, blank lines yield `None`.
    pub fn parse(line: &str) -> anyhow::Result<Option<CliCommand>> {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match keyword.to_ascii_uppercase().as_str() {
            "PLAY" => {
                let [video, port] = args.as_slice() else {
                    bail!("usage: PLAY <video> <port>");
                };
                let port: u16 = port.parse()
                    .map_err(|_| anyhow!("invalid port {:?}", port))?;
                if port == 0 {
                    bail!("port must not be 0");
                }
                CliCommand::Play { video: video.to_string(), port }
            }
            "STOP" if args.is_empty() => CliCommand::Stop,
            "QUIT" if args.is_empty() => CliCommand::Quit,
            "STOP" | "QUIT" => bail!("{} takes no arguments", keyword),
            _ => bail!("unknown command {:?} - {}", keyword, USAGE),
        };
        Ok(Some(command))
    }
}

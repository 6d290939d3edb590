//! Command-line surface.

use anyhow::bail;

pub const USAGE: &str = "usage: keyline-worker consume | push <value>... | push-urgent <value>... | len";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the consumer loop until the connection fails for good.
    Consume,
    /// Append values to the tail of the queue.
    Push(Vec<String>),
    /// Prepend values to the head of the queue, in the order given.
    PushUrgent(Vec<String>),
    /// Print the queue length.
    Len,
}

impl Command {
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        let Some(name) = args.next() else {
            bail!("missing command\n{USAGE}");
        };
        let rest: Vec<String> = args.collect();

        match name.as_str() {
            "consume" if rest.is_empty() => Ok(Command::Consume),
            "len" if rest.is_empty() => Ok(Command::Len),
            "consume" | "len" => bail!("`{name}` takes no arguments\n{USAGE}"),
            "push" | "push-urgent" if rest.is_empty() => bail!("`{name}` needs at least one value\n{USAGE}"),
            "push" => Ok(Command::Push(rest)),
            "push-urgent" => Ok(Command::PushUrgent(rest)),
            _ => bail!("unknown command `{name}`\n{USAGE}"),
        }
    }
}

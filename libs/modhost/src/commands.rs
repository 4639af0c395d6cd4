//! Command surface: sub-commands and root arguments contributed by modules.
//!
//! Parsing and dispatch are delegated to a [`CommandParser`]. The lifecycle only needs to know
//! whether the root action was selected (continue to PreRun/Run) or a named sub-command already
//! ran (stop there).

use clap::{ArgMatches, error::ErrorKind};
use std::{ffi::OsString, sync::Arc};

pub type CommandAction = Arc<dyn Fn(&ArgMatches) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to parse command line: {0}")]
    Parse(#[from] clap::Error),

    #[error("sub-command '{command}' failed")]
    Action {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("'{name}' is already bound on the command surface")]
    Duplicate { name: String },
}

/// A named sub-command plus the action run when it is selected.
#[derive(Clone)]
pub struct SubCommand {
    command: clap::Command,
    action: CommandAction,
}

impl SubCommand {
    pub fn new<F>(command: clap::Command, action: F) -> Self
    where
        F: Fn(&ArgMatches) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            command,
            action: Arc::new(action),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.command.get_name()
    }
}

impl std::fmt::Debug for SubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubCommand")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Everything one module binds: sub-commands and root arguments.
#[derive(Debug, Clone, Default)]
pub struct Commands {
    pub(crate) subcommands: Vec<SubCommand>,
    pub(crate) root_args: Vec<clap::Arg>,
}

impl Commands {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subcommand(mut self, sub: SubCommand) -> Self {
        self.subcommands.push(sub);
        self
    }

    #[must_use]
    pub fn root_arg(mut self, arg: clap::Arg) -> Self {
        self.root_args.push(arg);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subcommands.is_empty() && self.root_args.is_empty()
    }
}

/// What the parser decided.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// The root action was selected; the lifecycle continues.
    Root(ArgMatches),
    /// A named sub-command ran to completion.
    SubCommand(String),
    /// Help or version was printed.
    Exited,
}

/// Command-line parser collaborator.
pub trait CommandParser: Send {
    /// # Errors
    /// `Duplicate` when an argument with the same id is already bound.
    fn add_root_arg(&mut self, arg: clap::Arg) -> Result<(), CommandError>;

    /// # Errors
    /// `Duplicate` when a sub-command with the same name is already bound.
    fn add_subcommand(&mut self, sub: SubCommand) -> Result<(), CommandError>;

    /// Parse `args` (including the program name) and run the selected sub-command, if any.
    ///
    /// # Errors
    /// `Parse` on invalid input, `Action` if the selected sub-command failed.
    fn execute(&mut self, args: Vec<OsString>) -> Result<Dispatch, CommandError>;
}

/// `clap`-backed command surface.
pub struct ClapCommandSurface {
    root: clap::Command,
    actions: Vec<(String, CommandAction)>,
}

impl ClapCommandSurface {
    #[must_use]
    pub fn new(root: clap::Command) -> Self {
        Self {
            root,
            actions: Vec::new(),
        }
    }
}

impl Default for ClapCommandSurface {
    fn default() -> Self {
        Self::new(clap::Command::new("modhost"))
    }
}

impl CommandParser for ClapCommandSurface {
    fn add_root_arg(&mut self, arg: clap::Arg) -> Result<(), CommandError> {
        if self.root.get_arguments().any(|a| a.get_id() == arg.get_id()) {
            return Err(CommandError::Duplicate {
                name: arg.get_id().to_string(),
            });
        }
        let root = std::mem::take(&mut self.root);
        self.root = root.arg(arg);
        Ok(())
    }

    fn add_subcommand(&mut self, sub: SubCommand) -> Result<(), CommandError> {
        let name = sub.name().to_owned();
        if self.actions.iter().any(|(n, _)| *n == name) {
            return Err(CommandError::Duplicate { name });
        }
        let root = std::mem::take(&mut self.root);
        self.root = root.subcommand(sub.command);
        self.actions.push((name, sub.action));
        Ok(())
    }

    fn execute(&mut self, args: Vec<OsString>) -> Result<Dispatch, CommandError> {
        let matches = match self.root.try_get_matches_from_mut(args) {
            Ok(m) => m,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::DisplayHelp
                        | ErrorKind::DisplayVersion
                        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) =>
            {
                if let Err(print_err) = e.print() {
                    tracing::warn!(error = %print_err, "failed to print help");
                }
                return Ok(Dispatch::Exited);
            }
            Err(e) => return Err(CommandError::Parse(e)),
        };

        let Some((name, sub_matches)) = matches.subcommand() else {
            return Ok(Dispatch::Root(matches));
        };

        let Some((_, action)) = self.actions.iter().find(|(n, _)| n == name) else {
            // Only sub-commands added through `add_subcommand` can be selected.
            return Ok(Dispatch::Root(matches));
        };

        tracing::info!(command = name, "running sub-command");
        action(sub_matches).map_err(|source| CommandError::Action {
            command: name.to_owned(),
            source,
        })?;
        Ok(Dispatch::SubCommand(name.to_owned()))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use clap::Arg;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn argv(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    #[test]
    fn root_action_returns_matches_with_root_args() {
        let mut surface = ClapCommandSurface::new(clap::Command::new("app"));
        surface
            .add_root_arg(Arg::new("config").long("config").short('c'))
            .unwrap();

        let Dispatch::Root(m) = surface.execute(argv(&["app", "-c", "cfg.yml"])).unwrap() else {
            panic!("expected root dispatch");
        };
        assert_eq!(m.get_one::<String>("config").map(String::as_str), Some("cfg.yml"));
    }

    #[test]
    fn named_subcommand_runs_its_action() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut surface = ClapCommandSurface::new(clap::Command::new("app"));
        surface
            .add_subcommand(SubCommand::new(
                clap::Command::new("greet").arg(Arg::new("who").required(true)),
                move |m| {
                    assert_eq!(m.get_one::<String>("who").map(String::as_str), Some("bob"));
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ))
            .unwrap();

        let dispatch = surface.execute(argv(&["app", "greet", "bob"])).unwrap();
        assert!(matches!(dispatch, Dispatch::SubCommand(ref n) if n == "greet"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_action_is_reported() {
        let mut surface = ClapCommandSurface::default();
        surface
            .add_subcommand(SubCommand::new(clap::Command::new("boom"), |_| {
                anyhow::bail!("nope")
            }))
            .unwrap();

        let err = surface.execute(argv(&["modhost", "boom"])).unwrap_err();
        assert!(matches!(err, CommandError::Action { ref command, .. } if command == "boom"));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut surface = ClapCommandSurface::default();
        surface
            .add_subcommand(SubCommand::new(clap::Command::new("x"), |_| Ok(())))
            .unwrap();
        assert!(matches!(
            surface.add_subcommand(SubCommand::new(clap::Command::new("x"), |_| Ok(()))),
            Err(CommandError::Duplicate { .. })
        ));

        surface.add_root_arg(Arg::new("level").long("level")).unwrap();
        assert!(matches!(
            surface.add_root_arg(Arg::new("level").long("log-level")),
            Err(CommandError::Duplicate { .. })
        ));
    }

    #[test]
    fn unknown_argument_is_a_parse_error() {
        let mut surface = ClapCommandSurface::default();
        assert!(matches!(
            surface.execute(argv(&["modhost", "--nope"])),
            Err(CommandError::Parse(_))
        ));
    }

    #[test]
    fn help_exits_without_error() {
        let mut surface = ClapCommandSurface::default();
        assert!(matches!(
            surface.execute(argv(&["modhost", "--help"])).unwrap(),
            Dispatch::Exited
        ));
    }
}

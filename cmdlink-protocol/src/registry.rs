//! Command registry.
//!
//! Maps a command type to a constructor taking the decoded [`Header`]. The
//! decoder is the only consumer.

use crate::command::{Command, Heartbeat, RawCommand};
use crate::header::Header;
use std::collections::HashMap;
use std::fmt;

/// Builds an empty command from a decoded header.
pub type CommandConstructor = Box<dyn Fn(Header) -> Box<dyn Command> + Send + Sync>;

/// Resolves a command type to a fresh command instance.
pub trait CommandFactory: Send + Sync {
    /// Returns `None` if the command type is not known.
    fn create(&self, header: Header) -> Option<Box<dyn Command>>;
}

/// Map-based [`CommandFactory`] populated at startup.
#[derive(Default)]
pub struct CommandRegistry {
    constructors: HashMap<u32, CommandConstructor>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `command_type`, returning the one it replaced.
    pub fn register<F>(&mut self, command_type: u32, constructor: F) -> Option<CommandConstructor>
    where
        F: Fn(Header) -> Box<dyn Command> + Send + Sync + 'static,
    {
        self.constructors.insert(command_type, Box::new(constructor))
    }

    /// Registers `command_type` as an opaque-body [`RawCommand`].
    pub fn with_raw(mut self, command_type: u32) -> Self {
        self.register(command_type, |header| Box::new(RawCommand::from_header(header)));
        self
    }

    /// Registers the reserved heartbeat command type.
    pub fn with_heartbeat(mut self, command_type: u32) -> Self {
        self.register(command_type, |header| Box::new(Heartbeat::from_header(header)));
        self
    }

    /// Registers an arbitrary constructor (builder style).
    pub fn with<F>(mut self, command_type: u32, constructor: F) -> Self
    where
        F: Fn(Header) -> Box<dyn Command> + Send + Sync + 'static,
    {
        self.register(command_type, constructor);
        self
    }

    pub fn contains(&self, command_type: u32) -> bool {
        self.constructors.contains_key(&command_type)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl CommandFactory for CommandRegistry {
    fn create(&self, header: Header) -> Option<Box<dyn Command>> {
        self.constructors
            .get(&header.command_type)
            .map(|constructor| constructor(header))
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("CommandRegistry")
            .field("command_types", &types)
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const SEARCH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "safebooru",
        action: "search",
    },
    CommandSpec {
        command: "sb",
        action: "search",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "help",
    action: "help",
}];

pub const CHAT_HELP_COMMANDS: &[&str] = &["/safebooru <tags>", "/sb <tags>", "/help"];

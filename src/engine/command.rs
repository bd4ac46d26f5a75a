use std::collections::VecDeque;

use super::RUNNING_TIME_MAX;

/// One instruction for the output thread, produced per gathered GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Close the current fragment once the GOP has been written.
    pub start_new_fragment: bool,
    /// Exclusive upper bound of the running times released by this command.
    pub max_output_time: i64,
}

impl Command {
    pub fn gop(start_new_fragment: bool, max_output_time: i64) -> Self {
        Self {
            start_new_fragment,
            max_output_time,
        }
    }

    pub fn finish() -> Self {
        Self {
            start_new_fragment: false,
            max_output_time: RUNNING_TIME_MAX,
        }
    }

    pub fn is_final(&self) -> bool {
        self.max_output_time == RUNNING_TIME_MAX
    }
}

#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<Command>,
    pushed: u64,
}

impl CommandQueue {
    pub fn push(&mut self, command: Command) {
        self.pushed += 1;
        self.commands.push_back(command);
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Commands issued since the last reset, consumed or not.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.pushed = 0;
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<Command> {
        self.commands.iter().copied().collect()
    }
}

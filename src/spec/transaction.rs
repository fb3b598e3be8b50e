//! Transaction grammars: which replies a request accepts and when it is complete.

use std::collections::HashMap;

/// Which peer may originate a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    Client,
    Server,
    Both,
}

impl Originator {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "client" => Some(Originator::Client),
            "server" => Some(Originator::Server),
            "both" => Some(Originator::Both),
            _ => None,
        }
    }
}

/// How many times a reply may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCount {
    pub min: u32,
    pub max: Option<u32>,
}

impl ReplyCount {
    pub const ONE: ReplyCount = ReplyCount {
        min: 1,
        max: Some(1),
    };

    /// Parse a `count` attribute: a number, `?`, `*` or `+`.
    pub(crate) fn parse(value: &str, required: bool) -> Option<Self> {
        let count = match value {
            "?" => ReplyCount {
                min: 0,
                max: Some(1),
            },
            "*" => ReplyCount { min: 0, max: None },
            "+" => ReplyCount { min: 1, max: None },
            n => {
                let n = n.parse::<u32>().ok()?;
                ReplyCount { min: n, max: Some(n) }
            }
        };
        Some(if required {
            count
        } else {
            ReplyCount { min: 0, ..count }
        })
    }
}

/// A reply grammar node.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyGrammar {
    Reply { message: String, count: ReplyCount },
    And(Vec<ReplyGrammar>),
    Or(Vec<ReplyGrammar>),
}

impl ReplyGrammar {
    /// Every message name mentioned in the grammar.
    pub fn messages(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect(&mut names);
        names
    }

    fn collect<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            ReplyGrammar::Reply { message, .. } => names.push(message),
            ReplyGrammar::And(children) | ReplyGrammar::Or(children) => {
                children.iter().for_each(|c| c.collect(names))
            }
        }
    }

    fn touched(&self, counts: &HashMap<String, u32>) -> bool {
        match self {
            ReplyGrammar::Reply { message, .. } => counts.get(message).copied().unwrap_or(0) > 0,
            ReplyGrammar::And(children) | ReplyGrammar::Or(children) => {
                children.iter().any(|c| c.touched(counts))
            }
        }
    }

    /// Whether a reply named `name` may arrive next, given the replies counted so far.
    pub fn accepts(&self, name: &str, counts: &HashMap<String, u32>) -> bool {
        match self {
            ReplyGrammar::Reply { message, count } => {
                let seen = counts.get(message).copied().unwrap_or(0);
                message == name && count.max.map_or(true, |max| seen < max)
            }
            ReplyGrammar::And(children) => children.iter().any(|c| c.accepts(name, counts)),
            ReplyGrammar::Or(children) => match children.iter().find(|c| c.touched(counts)) {
                // An OR commits to the first branch that received anything.
                Some(chosen) => chosen.accepts(name, counts),
                None => children.iter().any(|c| c.accepts(name, counts)),
            },
        }
    }

    /// Whether the replies counted so far complete the grammar.
    pub fn is_satisfied(&self, counts: &HashMap<String, u32>) -> bool {
        match self {
            ReplyGrammar::Reply { message, count } => {
                counts.get(message).copied().unwrap_or(0) >= count.min
            }
            ReplyGrammar::And(children) => children.iter().all(|c| c.is_satisfied(counts)),
            ReplyGrammar::Or(children) => {
                let mut active = children.iter().filter(|c| c.touched(counts));
                match (active.next(), active.next()) {
                    (Some(chosen), None) => chosen.is_satisfied(counts),
                    _ => false,
                }
            }
        }
    }
}

/// A request message and the reply grammar it expects.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDefinition {
    pub message: String,
    pub originator: Originator,
    pub required: bool,
    pub replies: ReplyGrammar,
}

impl TransactionDefinition {
    pub fn accepts(&self, name: &str, counts: &HashMap<String, u32>) -> bool {
        self.replies.accepts(name, counts)
    }

    pub fn is_satisfied(&self, counts: &HashMap<String, u32>) -> bool {
        self.replies.is_satisfied(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(message: &str, count: ReplyCount) -> ReplyGrammar {
        ReplyGrammar::Reply {
            message: message.to_string(),
            count,
        }
    }

    fn counts(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_or_commits_to_first_branch() {
        let grammar = ReplyGrammar::Or(vec![
            reply("ack", ReplyCount::ONE),
            reply("auth_error", ReplyCount::ONE),
        ]);
        let empty = counts(&[]);
        assert!(grammar.accepts("ack", &empty));
        assert!(grammar.accepts("auth_error", &empty));
        assert!(!grammar.accepts("other", &empty));
        assert!(!grammar.is_satisfied(&empty));

        let after_ack = counts(&[("ack", 1)]);
        assert!(grammar.is_satisfied(&after_ack));
        assert!(!grammar.accepts("auth_error", &after_ack));
    }

    #[test]
    fn test_and_with_repeated_reply() {
        let grammar = ReplyGrammar::And(vec![
            reply("list", ReplyCount { min: 0, max: None }),
            reply("done", ReplyCount::ONE),
        ]);
        let listed = counts(&[("list", 3)]);
        assert!(grammar.accepts("list", &listed));
        assert!(!grammar.is_satisfied(&listed));
        let done = counts(&[("list", 3), ("done", 1)]);
        assert!(grammar.is_satisfied(&done));
        assert!(!grammar.accepts("done", &done));
    }

    #[test]
    fn test_count_parsing() {
        assert_eq!(ReplyCount::parse("1", true), Some(ReplyCount::ONE));
        assert_eq!(
            ReplyCount::parse("*", true),
            Some(ReplyCount { min: 0, max: None })
        );
        assert_eq!(
            ReplyCount::parse("1", false),
            Some(ReplyCount {
                min: 0,
                max: Some(1)
            })
        );
        assert_eq!(ReplyCount::parse("many", true), None);
    }
}

use std::fmt::Write;

use rand::seq::SliceRandom;

use lineup_types::models::Attendee;

pub const NO_ONE_COMING: &str = "No one is coming.";

const ANONYMOUS: &str = "Anonymous";

/// Source of the attendee permutation.
pub trait Shuffler: Send + Sync + 'static {
    fn shuffle(&self, attendees: &mut [Attendee]);
}

/// Uniform shuffle from the thread-local RNG. A fresh order every call, so no
/// voter is systematically listed first across polls.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomShuffler;

impl Shuffler for RandomShuffler {
    fn shuffle(&self, attendees: &mut [Attendee]) {
        attendees.shuffle(&mut rand::rng());
    }
}

/// Render the results message for a poll.
pub fn render_results<S>(topic: &str, mut attendees: Vec<Attendee>, shuffler: &S) -> String
where
    S: Shuffler + ?Sized,
{
    let mut out = String::new();
    let _ = writeln!(out, "Results for: {}", topic);

    if attendees.is_empty() {
        out.push_str(NO_ONE_COMING);
        return out;
    }

    shuffler.shuffle(&mut attendees);
    for (i, attendee) in attendees.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, display_entry(attendee));
    }
    out
}

fn display_entry(attendee: &Attendee) -> String {
    match (&attendee.username, &attendee.name) {
        (Some(handle), Some(name)) => format!("@{} ({})", handle, name),
        (Some(handle), None) => format!("@{}", handle),
        (None, Some(name)) => name.clone(),
        (None, None) => ANONYMOUS.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use lineup_types::models::Identity;

    /// Keeps the ledger order.
    struct NoShuffle;

    impl Shuffler for NoShuffle {
        fn shuffle(&self, _attendees: &mut [Attendee]) {}
    }

    struct Reverse;

    impl Shuffler for Reverse {
        fn shuffle(&self, attendees: &mut [Attendee]) {
            attendees.reverse();
        }
    }

    fn people() -> Vec<Attendee> {
        vec![
            Identity::new(1, Some("ann".into()), Some("Ann Lee".into())),
            Identity::new(2, None, Some("Bob".into())),
            Identity::new(3, None, None),
            Identity::new(4, Some("dee".into()), None),
        ]
    }

    #[test]
    fn test_empty_list_is_fixed_message() {
        for topic in ["Practice", "", "Game night | 2h"] {
            let text = render_results(topic, vec![], &RandomShuffler);
            assert_eq!(text, format!("Results for: {}\n{}", topic, NO_ONE_COMING));
        }
    }

    #[test]
    fn test_exact_output_with_fixed_permutation() {
        let text = render_results("Practice", people(), &NoShuffle);
        assert_eq!(
            text,
            "Results for: Practice\n\
             1. @ann (Ann Lee)\n\
             2. Bob\n\
             3. Anonymous\n\
             4. @dee\n"
        );

        let reversed = render_results("Practice", people(), &Reverse);
        assert!(reversed.starts_with("Results for: Practice\n1. @dee\n2. Anonymous\n"));
    }

    #[test]
    fn test_random_order_keeps_same_lines() {
        let expected: HashSet<String> = ["@ann (Ann Lee)", "Bob", "Anonymous", "@dee"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let text = render_results("Practice", people(), &RandomShuffler);
        let lines: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(lines.len(), 4);

        let mut entries = HashSet::new();
        for (i, line) in lines.iter().enumerate() {
            let prefix = format!("{}. ", i + 1);
            let entry = line.strip_prefix(&prefix).expect("one-indexed line");
            entries.insert(entry.to_string());
        }
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_random_order_varies() {
        let many: Vec<Attendee> = (0..8)
            .map(|i| Identity::new(i, None, Some(format!("Player {i}"))))
            .collect();
        let outputs: HashSet<String> = (0..20)
            .map(|_| render_results("Practice", many.clone(), &RandomShuffler))
            .collect();
        assert!(outputs.len() > 1);
    }
}

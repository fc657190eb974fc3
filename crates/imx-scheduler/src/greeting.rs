//! Scheduled morning and evening greetings

use imx_core::api::Hitokoto;
use imx_core::types::{NotificationRecord, SourceKind};
use rand::Rng;
use rand::seq::SliceRandom;

pub const DEFAULT_MORNING_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_EVENING_CRON: &str = "0 0 22 * * *";

const MORNING_PHRASES: &[&str] = &[
    "Let's make today count.",
    "Wishing you a day full of energy!",
    "Today is full of hope too.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GreetingKind {
    Morning,
    Evening,
}

impl std::fmt::Display for GreetingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Morning => f.write_str("morning"),
            Self::Evening => f.write_str("evening"),
        }
    }
}

pub fn greeting_record<R: Rng + ?Sized>(
    kind: GreetingKind,
    quote: &Hitokoto,
    rng: &mut R,
) -> NotificationRecord {
    let opening = match kind {
        GreetingKind::Morning => {
            let phrase = MORNING_PHRASES.choose(rng).copied().unwrap_or_default();
            format!("Good morning! {}", phrase)
        }
        GreetingKind::Evening => "Good night, get some rest!".to_string(),
    };
    NotificationRecord::new(SourceKind::Greeting, format!("{}\n\n{}", opening, quote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn quote() -> Hitokoto {
        Hitokoto {
            hitokoto: "Stay hungry.".into(),
            from: "Whole Earth Catalog".into(),
            from_who: None,
        }
    }

    #[test]
    fn test_morning_uses_a_known_phrase() {
        let mut rng = StdRng::seed_from_u64(7);
        let record = greeting_record(GreetingKind::Morning, &quote(), &mut rng);

        assert_eq!(record.source(), SourceKind::Greeting);
        assert!(record.text().starts_with("Good morning! "));
        assert!(MORNING_PHRASES.iter().any(|p| record.text().contains(p)));
        assert!(record.text().ends_with("Stay hungry. --「Whole Earth Catalog」"));
    }

    #[test]
    fn test_evening_greeting() {
        let mut rng = StdRng::seed_from_u64(7);
        let record = greeting_record(GreetingKind::Evening, &Hitokoto::fallback(), &mut rng);
        assert_eq!(
            record.text(),
            "Good night, get some rest!\n\nKeep going today! --「imx」"
        );
    }
}

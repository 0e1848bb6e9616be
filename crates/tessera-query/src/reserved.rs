//! SQL-92 reserved words.

use std::collections::HashSet;
use std::sync::OnceLock;

const SQL92: &str = "
    absolute action add all allocate alter and any are as asc assertion at
    authorization avg begin between bit bit_length both by cascade cascaded
    case cast catalog char character char_length character_length check close
    coalesce collate collation column commit connect connection constraint
    constraints continue convert corresponding count create cross current
    current_date current_time current_timestamp current_user cursor date day
    deallocate dec decimal declare default deferrable deferred delete desc
    describe descriptor diagnostics disconnect distinct domain double drop
    else end end-exec escape except exception exec execute exists external
    extract false fetch first float for foreign found from full get global go
    goto grant group having hour identity immediate in indicator initially
    inner input insensitive insert int integer intersect interval into is
    isolation join key language last leading left level like local lower
    match max min minute module month names national natural nchar next no
    not null nullif numeric octet_length of on only open option or order
    outer output overlaps pad partial position precision prepare preserve
    primary prior privileges procedure public read real references relative
    restrict revoke right rollback rows schema scroll second section select
    session session_user set size smallint some space sql sqlcode sqlerror
    sqlstate substring sum system_user table temporary then time timestamp
    timezone_hour timezone_minute to trailing transaction translate
    translation trim true union unique unknown update upper usage user using
    value values varchar varying view when whenever where with work write
    year zone
";

fn words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| SQL92.split_whitespace().collect())
}

/// Is `word` reserved in SQL-92? Comparison ignores ASCII case.
pub fn is_sql92_reserved(word: &str) -> bool {
    words().contains(word.to_ascii_lowercase().as_str())
}

/// A reserved-word set extending SQL-92 with dialect words.
#[derive(Debug, Clone, Default)]
pub struct ReservedWords {
    extra: HashSet<String>,
}

impl ReservedWords {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add(words);
        self
    }

    pub fn add<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extra
            .extend(words.into_iter().map(|w| w.as_ref().to_ascii_lowercase()));
    }

    pub fn remove(&mut self, word: &str) {
        self.extra.remove(&word.to_ascii_lowercase());
    }

    pub fn contains(&self, word: &str) -> bool {
        is_sql92_reserved(word) || self.extra.contains(&word.to_ascii_lowercase())
    }
}

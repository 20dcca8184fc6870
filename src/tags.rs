//! # Tag Storage Strategies
//!
//! Tags are attached to events at write time and queried across streams in
//! ordering order. Two layouts are supported, selected by `tag-storage`:
//!
//! ```text
//! array (default)                          delimited
//! ───────────────                          ─────────
//! event_journal.tags = '["blue","green"]'  event_journal.tags = ';blue;green;'
//! event_journal_tags(tag, ordering)        (no extra table)
//!   ('blue', 17), ('green', 17)
//!
//! query: JOIN on the index table           query: instr(tags, ';green;') > 0
//!        (primary key lookup)                     (scans the journal)
//! ```
//!
//! The array layout keeps one `(tag, ordering)` row per event and tag, which
//! makes tag queries an index range scan. The delimited layout needs no extra
//! table but has to scan, and the whole tag string must fit `tags-column-size`.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::settings::{JournalSettings, TagStorage};
use crate::schema::qualified_name;

/// Separator used by the delimited layout.
pub const TAG_DELIMITER: char = ';';

/// Common interface of the tag layouts.
///
/// SQL fragments returned here use `?1` for the tag parameter and `e` as the
/// journal table alias.
pub(crate) trait TagStrategy: Send + Sync {
    /// Value for the `tags` column, `None` when the event has no tags.
    fn encode(&self, tags: &BTreeSet<String>) -> Result<Option<String>>;

    /// Parses a `tags` column value.
    fn decode(&self, raw: Option<&str>) -> Result<BTreeSet<String>>;

    /// Records index rows for a freshly inserted event.
    fn index(&self, conn: &Connection, ordering: i64, tags: &BTreeSet<String>) -> Result<()>;

    /// Removes index rows of events about to be deleted.
    fn unindex(&self, conn: &Connection, persistence_id: &str, to_sequence_nr: i64) -> Result<()>;

    /// Extra `FROM` clause for tag queries.
    fn query_join(&self) -> String;

    /// `WHERE` condition matching events that carry `?1`.
    fn query_predicate(&self) -> String;

    /// Rejects a queried tag that `query_predicate` could not match exactly.
    fn check_query(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// Builds the strategy configured in `settings`.
pub(crate) fn strategy_for(settings: &JournalSettings) -> Box<dyn TagStrategy> {
    match settings.tag_storage() {
        TagStorage::Array => Box::new(ArrayTags {
            journal_table: qualified_name(settings.schema_name(), settings.table_name()),
            tags_table: qualified_name(settings.schema_name(), &settings.tags_table_name()),
        }),
        TagStorage::Delimited => Box::new(DelimitedTags {
            column_size: settings.tags_column_size(),
        }),
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::InvalidRequest("tags must not be empty".to_string()));
    }
    Ok(())
}

// =============================================================================
// Array Layout
// =============================================================================

struct ArrayTags {
    journal_table: String,
    tags_table: String,
}

impl TagStrategy for ArrayTags {
    fn encode(&self, tags: &BTreeSet<String>) -> Result<Option<String>> {
        if tags.is_empty() {
            return Ok(None);
        }
        for tag in tags {
            validate_tag(tag)?;
        }
        serde_json::to_string(tags)
            .map(Some)
            .map_err(|e| Error::Serialization(format!("tags: {e}")))
    }

    fn decode(&self, raw: Option<&str>) -> Result<BTreeSet<String>> {
        match raw {
            None | Some("") => Ok(BTreeSet::new()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| Error::Serialization(format!("tags column '{raw}': {e}"))),
        }
    }

    fn index(&self, conn: &Connection, ordering: i64, tags: &BTreeSet<String>) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {} (tag, ordering) VALUES (?1, ?2)",
            self.tags_table
        ))?;
        for tag in tags {
            stmt.execute(params![tag, ordering])?;
        }
        Ok(())
    }

    fn unindex(&self, conn: &Connection, persistence_id: &str, to_sequence_nr: i64) -> Result<()> {
        conn.prepare_cached(&format!(
            "DELETE FROM {} WHERE ordering IN (
                 SELECT ordering FROM {} WHERE persistence_id = ?1 AND sequence_nr <= ?2
             )",
            self.tags_table, self.journal_table
        ))?
        .execute(params![persistence_id, to_sequence_nr])?;
        Ok(())
    }

    fn query_join(&self) -> String {
        format!("JOIN {} AS t ON t.ordering = e.ordering", self.tags_table)
    }

    fn query_predicate(&self) -> String {
        "t.tag = ?1".to_string()
    }
}

// =============================================================================
// Delimited Layout
// =============================================================================

struct DelimitedTags {
    column_size: usize,
}

impl TagStrategy for DelimitedTags {
    fn encode(&self, tags: &BTreeSet<String>) -> Result<Option<String>> {
        if tags.is_empty() {
            return Ok(None);
        }

        let mut encoded = String::from(TAG_DELIMITER);
        for tag in tags {
            validate_tag(tag)?;
            if tag.contains(TAG_DELIMITER) {
                return Err(Error::InvalidRequest(format!(
                    "tag '{tag}' contains the delimiter '{TAG_DELIMITER}'"
                )));
            }
            encoded.push_str(tag);
            encoded.push(TAG_DELIMITER);
        }

        if encoded.chars().count() > self.column_size {
            return Err(Error::InvalidRequest(format!(
                "encoded tags are {} characters, tags-column-size is {}",
                encoded.chars().count(),
                self.column_size
            )));
        }
        Ok(Some(encoded))
    }

    fn decode(&self, raw: Option<&str>) -> Result<BTreeSet<String>> {
        Ok(raw
            .unwrap_or_default()
            .split(TAG_DELIMITER)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn index(&self, _conn: &Connection, _ordering: i64, _tags: &BTreeSet<String>) -> Result<()> {
        Ok(())
    }

    fn unindex(&self, _conn: &Connection, _pid: &str, _to_sequence_nr: i64) -> Result<()> {
        Ok(())
    }

    fn query_join(&self) -> String {
        String::new()
    }

    fn query_predicate(&self) -> String {
        format!("instr(e.tags, '{TAG_DELIMITER}' || ?1 || '{TAG_DELIMITER}') > 0")
    }

    // ";blue;green;" contains ";blue;green;", so a delimiter in the query
    // would match a combination of tags.
    fn check_query(&self, tag: &str) -> Result<()> {
        if tag.contains(TAG_DELIMITER) {
            return Err(Error::InvalidRequest(format!(
                "tag '{tag}' contains the delimiter '{TAG_DELIMITER}'"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::JournalConfig;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|t| t.to_string()).collect()
    }

    fn strategy(storage: TagStorage, column_size: usize) -> Box<dyn TagStrategy> {
        let mut config = JournalConfig::new("tags.db");
        config.tag_storage = storage;
        config.tags_column_size = column_size;
        strategy_for(&config.build().unwrap())
    }

    #[test]
    fn test_delimited_encoding() {
        let s = strategy(TagStorage::Delimited, 2000);

        assert_eq!(s.encode(&tags(&[])).unwrap(), None);
        assert_eq!(
            s.encode(&tags(&["green", "blue"])).unwrap().as_deref(),
            Some(";blue;green;")
        );
        assert_eq!(s.decode(Some(";blue;green;")).unwrap(), tags(&["blue", "green"]));
        assert!(s.decode(None).unwrap().is_empty());
    }

    #[test]
    fn test_delimited_rejects_bad_tags() {
        let s = strategy(TagStorage::Delimited, 8);

        assert!(matches!(
            s.encode(&tags(&["a;b"])),
            Err(Error::InvalidRequest(_))
        ));
        assert!(s.encode(&tags(&[""])).is_err());
        // ";abcdefg;" is 9 characters
        assert!(s.encode(&tags(&["abcdefg"])).is_err());
        assert!(s.encode(&tags(&["abcdef"])).is_ok());
    }

    #[test]
    fn test_array_encoding() {
        let s = strategy(TagStorage::Array, 2000);

        let encoded = s.encode(&tags(&["x;y", "green"])).unwrap().unwrap();
        assert_eq!(encoded, r#"["green","x;y"]"#);
        assert_eq!(s.decode(Some(encoded.as_str())).unwrap(), tags(&["green", "x;y"]));
        assert!(s.decode(None).unwrap().is_empty());
        assert!(s.decode(Some("not json")).is_err());
    }

    #[test]
    fn test_query_fragments() {
        let array = strategy(TagStorage::Array, 2000);
        assert_eq!(
            array.query_join(),
            r#"JOIN "main"."event_journal_tags" AS t ON t.ordering = e.ordering"#
        );
        assert_eq!(array.query_predicate(), "t.tag = ?1");

        let delimited = strategy(TagStorage::Delimited, 2000);
        assert!(delimited.query_join().is_empty());
        assert_eq!(
            delimited.query_predicate(),
            "instr(e.tags, ';' || ?1 || ';') > 0"
        );
    }

    #[test]
    fn test_query_tag_checks() {
        let delimited = strategy(TagStorage::Delimited, 2000);
        assert!(matches!(
            delimited.check_query("blue;green"),
            Err(Error::InvalidRequest(_))
        ));
        assert!(delimited.check_query("blue").is_ok());

        // The index table matches whole values, any character goes.
        let array = strategy(TagStorage::Array, 2000);
        assert!(array.check_query("x;y").is_ok());
    }
}

//! Known table and column spellings of external novel databases.
//!
//! Producers have shipped several casings and names for the same data. The
//! mapping for a source is resolved once, before any row is read; each
//! field then has a fixed position in the generated `SELECT`, with `NULL`
//! standing in for columns the source lacks.

pub struct FieldSpec {
    pub field: &'static str,
    pub variants: &'static [&'static str],
    /// Rows cannot be keyed without it.
    pub key: bool,
}

pub struct TableSpec {
    pub names: &'static [&'static str],
    pub fields: &'static [FieldSpec],
}

impl TableSpec {
    pub fn canonical_name(&self) -> &'static str {
        self.names[0]
    }

    pub fn position(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.field == field)
    }
}

pub const NOVELS: TableSpec = TableSpec {
    names: &["novels_descs"],
    fields: &[
        FieldSpec { field: "ncode", variants: &["ncode"], key: true },
        FieldSpec { field: "title", variants: &["title", "novel_title"], key: false },
        FieldSpec { field: "author", variants: &["author", "writer"], key: false },
        FieldSpec { field: "synopsis", variants: &["synopsis", "story"], key: false },
        FieldSpec { field: "main_tags", variants: &["main_tags", "main_tag", "maintag"], key: false },
        FieldSpec { field: "sub_tags", variants: &["sub_tags", "sub_tag", "subtag", "keyword"], key: false },
        FieldSpec { field: "rating", variants: &["rating", "global_point"], key: false },
        FieldSpec { field: "total_ep", variants: &["total_ep", "totalep", "general_all_no"], key: false },
        FieldSpec { field: "general_lastup", variants: &["general_lastup", "generallastup", "last_update"], key: false },
    ],
};

pub const EPISODES: TableSpec = TableSpec {
    names: &["episodes"],
    fields: &[
        FieldSpec { field: "ncode", variants: &["ncode"], key: true },
        FieldSpec { field: "episode_no", variants: &["episode_no", "episodeno", "ep_no"], key: true },
        FieldSpec { field: "e_title", variants: &["e_title", "etitle", "episode_title", "title"], key: false },
        FieldSpec { field: "body", variants: &["body", "text", "content"], key: false },
        FieldSpec { field: "update_time", variants: &["update_time", "updatetime", "updated_at"], key: false },
    ],
};

pub const LAST_READ: TableSpec = TableSpec {
    names: &["last_read_novel", "rast_read_novel"],
    fields: &[
        FieldSpec { field: "ncode", variants: &["ncode"], key: true },
        FieldSpec { field: "date", variants: &["date", "read_date", "read_at"], key: false },
        FieldSpec { field: "episode_no", variants: &["episode_no", "episodeno", "episode"], key: false },
    ],
};

pub const REQUIRED_TABLES: [&TableSpec; 3] = [&NOVELS, &EPISODES, &LAST_READ];

/// Column choices for one external table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub table: String,
    /// Actual column per field, in [`TableSpec::fields`] order.
    pub columns: Vec<Option<String>>,
}

impl ColumnMap {
    pub fn select_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| match c {
                Some(name) => quote_ident(name),
                None => "NULL".to_string(),
            })
            .collect();
        format!(
            "SELECT {} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            columns.join(", "),
            quote_ident(&self.table)
        )
    }

    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table))
    }
}

/// Pick the actual name of `spec`'s table among `tables`, ignoring case.
pub fn find_table(spec: &TableSpec, tables: &[String]) -> Option<String> {
    spec.names
        .iter()
        .find_map(|name| tables.iter().find(|t| t.eq_ignore_ascii_case(name)))
        .cloned()
}

/// Resolve every field of `spec` against the columns the table really has.
/// Missing key columns are returned as `table.field` names.
pub fn resolve_columns(spec: &TableSpec, table: &str, actual: &[String]) -> Result<ColumnMap, Vec<String>> {
    let mut missing = Vec::new();
    let columns = spec
        .fields
        .iter()
        .map(|field| {
            let found = field
                .variants
                .iter()
                .find_map(|variant| actual.iter().find(|c| normalize(c) == normalize(variant)))
                .cloned();
            if found.is_none() && field.key {
                missing.push(format!("{}.{}", spec.canonical_name(), field.field));
            }
            found
        })
        .collect();

    if missing.is_empty() {
        Ok(ColumnMap {
            table: table.to_string(),
            columns,
        })
    } else {
        Err(missing)
    }
}

/// Case-insensitive, and `episodeNo` matches `episode_no`.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_case_and_spelling_variants() {
        let map = resolve_columns(
            &NOVELS,
            "novels_descs",
            &names(&["Ncode", "Title", "Synopsis", "mainTag", "general_all_no"]),
        )
        .unwrap();
        assert_eq!(map.columns[0].as_deref(), Some("Ncode"));
        assert_eq!(map.columns[3].as_deref(), Some("Synopsis"));
        assert_eq!(map.columns[4].as_deref(), Some("mainTag"));
        assert_eq!(map.columns[2], None);
        assert_eq!(map.columns[7].as_deref(), Some("general_all_no"));
        assert_eq!(
            map.select_sql(),
            "SELECT \"Ncode\", \"Title\", NULL, \"Synopsis\", \"mainTag\", NULL, NULL, \"general_all_no\", NULL \
             FROM \"novels_descs\" ORDER BY rowid LIMIT ?1 OFFSET ?2"
        );
    }

    #[test]
    fn missing_key_column_is_reported() {
        let err = resolve_columns(&EPISODES, "episodes", &names(&["ncode", "body"])).unwrap_err();
        assert_eq!(err, vec!["episodes.episode_no".to_string()]);
    }

    #[test]
    fn last_read_accepts_legacy_table_name() {
        let tables = names(&["novels_descs", "episodes", "rast_read_novel"]);
        assert_eq!(find_table(&LAST_READ, &tables).as_deref(), Some("rast_read_novel"));
        let tables = names(&["NOVELS_DESCS"]);
        assert_eq!(find_table(&NOVELS, &tables).as_deref(), Some("NOVELS_DESCS"));
        assert_eq!(find_table(&EPISODES, &tables), None);
    }
}

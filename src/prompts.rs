//! Prompt construction for the query pipeline.
//!
//! Pure functions: (schema, question, prior query, prior error) in, prompt
//! text out. The synthesis step is deliberately two-shot — a spec-lookup
//! prompt first asks the model which GTFS concepts the question touches, so
//! the domain reasoning is logged and inspectable before it shapes any
//! executable SQL.

use crate::store::{RowSet, SchemaSnapshot};
use regex::Regex;
use std::sync::OnceLock;

/// How many result rows the humanization prompt may quote.
const SUMMARY_SAMPLE_ROWS: usize = 10;

/// A system/user prompt pair for one completion call.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Ask which GTFS concepts and fields are relevant to the question, given the
/// standard vocabulary (not the live feed).
pub fn spec_lookup(question: &str) -> Prompt {
    Prompt {
        system: format!(
            "You are a GTFS expert. Given the GTFS reference vocabulary below, \
             explain in a few short sentences which tables, columns, and GTFS \
             concepts are relevant to the user's question, and how they relate. \
             Do not write any SQL.\n\n{}",
            crate::gtfs::condensed_vocabulary()
        ),
        user: question.to_string(),
    }
}

/// Ask for exactly one executable SQLite query answering the question.
pub fn synthesis(
    schema: &SchemaSnapshot,
    interpretation: &str,
    history: &[(String, String)],
    question: &str,
) -> Prompt {
    let system = format!(
        "You are an expert GTFS and SQL engineer. Respond ONLY with a single \
         valid SQLite query answering the user's question, based on this \
         schema of the loaded feed:\n\n{}\n\n\
         Guidelines:\n\
         1. Do not nest aggregate functions; use subqueries or CTEs instead.\n\
         2. Qualify column names with their table names.\n\
         3. Include human-readable names alongside IDs in the result when possible.\n\
         4. Match on partial strings for ambiguous values (LIKE with wildcards); colors are hex strings.\n\
         5. Only use tables and columns that exist in the schema above.\n\
         6. Prefer CTEs over deeply nested queries.\n\
         7. Only use functions SQLite supports.\n\n\
         Your response must be the SQL query and nothing else: no explanations, \
         no code fences.",
        schema.describe()
    );

    let mut user = String::new();
    for (role, text) in history {
        user.push_str(&format!("{}: {}\n", role, text));
    }
    user.push_str(&format!(
        "Relevant GTFS concepts for this question:\n{}\n\nQuestion: {}",
        interpretation, question
    ));

    Prompt { system, user }
}

/// Ask for a corrected query after an execution failure.
pub fn repair(schema: &SchemaSnapshot, failed_sql: &str, error: &str) -> Prompt {
    Prompt {
        system: format!(
            "You are an expert GTFS and SQL engineer. Correct the SQLite query \
             below, which failed to execute. Respond ONLY with the corrected \
             query: no explanations, no code fences.\n\nSchema:\n{}",
            schema.describe()
        ),
        user: format!("Failed query:\n{}\n\nError message: {}", failed_sql, error),
    }
}

/// Ask for a loosened query after a syntactically fine query matched nothing.
pub fn empty_result_repair(schema: &SchemaSnapshot, sql: &str) -> Prompt {
    Prompt {
        system: format!(
            "You are an expert GTFS and SQL engineer. The SQLite query below \
             executed successfully but returned no rows. Modify it so it is \
             likely to return results. Consider:\n\
             1. Are WHERE clauses too restrictive? Try partial string matches.\n\
             2. Are JOINs eliminating all rows?\n\
             3. Are all referenced columns correct for this schema?\n\n\
             Schema:\n{}\n\n\
             Respond ONLY with the modified query: no explanations, no code fences.",
            schema.describe()
        ),
        user: format!("Query that returned no rows:\n{}", sql),
    }
}

/// Ask for a short natural-language summary of the result rows.
pub fn humanize(question: &str, result: &RowSet) -> Prompt {
    let sample: Vec<&Vec<serde_json::Value>> =
        result.rows.iter().take(SUMMARY_SAMPLE_ROWS).collect();
    let sample_json =
        serde_json::to_string_pretty(&sample).unwrap_or_else(|_| "[]".to_string());

    Prompt {
        system: "Summarize the answer in natural conversational language.\n\
                 Guidelines:\n\
                 1. State the total number of results using the 'total result count' \
                    the user provides, never the truncated sample length.\n\
                 2. Mention key data points or trends.\n\
                 3. No technical detail about the data format or the query.\n\
                 4. No preamble like 'the results show'. Just answer the question.\n\
                 Use short, clear sentences. Keep it under two sentences."
            .to_string(),
        user: format!(
            "Question: {}\nColumns: {}\nSample rows:\n{}\nTotal result count: {}",
            question,
            result.columns.join(", "),
            sample_json,
            result.row_count()
        ),
    }
}

/// Strip formatting fences and surrounding commentary from a completion that
/// was supposed to be bare SQL. Leading `--` comment lines are kept (they
/// parse), prose is not.
pub fn clean_sql(completion: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:sql)?\s*(.*?)```").unwrap()
    });

    let body = match fence.captures(completion) {
        Some(caps) => caps[1].to_string(),
        None => completion.to_string(),
    };

    // Drop prose lines before the SQL starts.
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.iter().position(|line| {
        let upper = line.trim_start().to_uppercase();
        upper.starts_with("--")
            || upper.starts_with("SELECT")
            || upper.starts_with("WITH")
            || upper.starts_with("INSERT")
            || upper.starts_with("UPDATE")
            || upper.starts_with("DELETE")
            || upper.starts_with("CREATE")
            || upper.starts_with("DROP")
            || upper.starts_with("PRAGMA")
            || upper.starts_with("(")
    });

    match start {
        Some(idx) => lines[idx..].join("\n").trim().to_string(),
        None => body.trim().to_string(),
    }
}

//! Interactive question loop: translate, gate, execute, print

use std::io::{self, BufRead, Write};

use askdata_duck::{QueryExecutionError, QueryExecutor, QueryResult, SchemaDescription, Table};
use askdata_gate::{BlockedQueryError, SafetyGate};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::llm::{Translation, TranslationError, Translator};
use crate::render::render_result;

const PROMPT: &str = "Ask a data question (or type 'exit'): ";

/// Everything that can go wrong with a single question. None of these end
/// the session.
#[derive(Debug, Error)]
pub enum QuestionError {
    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Blocked(#[from] BlockedQueryError),

    #[error(transparent)]
    Execution(#[from] QueryExecutionError),
}

impl QuestionError {
    fn label(&self) -> &'static str {
        match self {
            QuestionError::Translation(_) => "[LLM error]",
            QuestionError::Blocked(_) => "[Query blocked]",
            QuestionError::Execution(_) => "[Execution error]",
        }
    }
}

/// One question's trip through the pipeline
#[derive(Debug)]
pub struct Exchange {
    /// Absent when translation itself failed
    pub translation: Option<Translation>,
    pub result: Result<QueryResult, QuestionError>,
}

pub struct Session<'a, T> {
    table: &'a Table,
    schema: &'a SchemaDescription,
    translator: T,
    gate: SafetyGate,
    max_rows: usize,
    prompt_samples: usize,
}

impl<'a, T: Translator> Session<'a, T> {
    pub fn new(
        table: &'a Table,
        schema: &'a SchemaDescription,
        translator: T,
        gate: SafetyGate,
        max_rows: usize,
        prompt_samples: usize,
    ) -> Self {
        Self {
            table,
            schema,
            translator,
            gate,
            max_rows,
            prompt_samples,
        }
    }

    /// Translate, gate and execute one question
    pub async fn ask(&self, question: &str) -> Exchange {
        let translation = match self.translator.translate(question, self.schema).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "translation failed");
                return Exchange {
                    translation: None,
                    result: Err(e.into()),
                };
            }
        };
        tracing::info!(sql = %translation.sql, "model proposed query");

        let result = self
            .gate
            .approve(translation.sql.clone())
            .map_err(QuestionError::from)
            .and_then(|approved| {
                QueryExecutor::new(self.table)
                    .execute(&approved)
                    .map_err(QuestionError::from)
            });

        match &result {
            Ok(r) => tracing::info!(rows = r.row_count(), "question answered"),
            Err(e) => tracing::warn!(error = %e, "question failed"),
        }

        Exchange {
            translation: Some(translation),
            result,
        }
    }

    /// Read questions until an empty line, `exit`/`quit`, or end of input.
    /// Returns the number of questions asked.
    pub async fn run<R: BufRead, W: Write>(&self, mut input: R, out: &mut W) -> io::Result<usize> {
        writeln!(out, "=== Data loaded ===")?;
        writeln!(out, "{}", self.schema.to_prompt(self.prompt_samples))?;

        let mut asked = 0;
        loop {
            write!(out, "\n{}", PROMPT)?;
            out.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                break;
            }
            let question = line.trim();
            if is_exit(question) {
                writeln!(out, "Bye.")?;
                break;
            }

            asked += 1;
            let span = tracing::info_span!("question", id = %Uuid::new_v4());
            let exchange = self.ask(question).instrument(span).await;
            self.print_exchange(&exchange, out)?;
        }

        Ok(asked)
    }

    fn print_exchange<W: Write>(&self, exchange: &Exchange, out: &mut W) -> io::Result<()> {
        if let Some(t) = &exchange.translation {
            writeln!(out, "\n[Generated SQL]")?;
            writeln!(out, "{}", t.sql)?;
            if let Some(comment) = &t.comment {
                writeln!(out, "[Comment] {}", comment)?;
            }
        }

        match &exchange.result {
            Ok(result) => {
                writeln!(out, "\n=== Result ===")?;
                writeln!(out, "{}", render_result(result, self.max_rows))?;
            }
            Err(e) => writeln!(out, "{} {}", e.label(), e)?,
        }
        Ok(())
    }
}

fn is_exit(question: &str) -> bool {
    question.is_empty()
        || question.eq_ignore_ascii_case("exit")
        || question.eq_ignore_ascii_case("quit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::parse_plan;
    use askdata_duck::LoadOptions;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned model replies in order
    struct ScriptedLlm(Mutex<VecDeque<Result<String, String>>>);

    impl ScriptedLlm {
        fn new(replies: &[Result<&str, &str>]) -> Self {
            let replies = replies
                .iter()
                .map(|r| r.map(str::to_string).map_err(str::to_string))
                .collect();
            Self(Mutex::new(replies))
        }
    }

    #[async_trait]
    impl Translator for ScriptedLlm {
        async fn translate(
            &self,
            _question: &str,
            _schema: &SchemaDescription,
        ) -> Result<Translation, TranslationError> {
            let next = self.0.lock().unwrap().pop_front().expect("no scripted reply left");
            match next {
                Ok(sql) => Ok(Translation {
                    sql: sql.into(),
                    comment: None,
                }),
                Err(raw) => Err(TranslationError::Unparseable { attempts: 2, raw }),
            }
        }
    }

    fn load_table(name: &str, rows: usize) -> Table {
        let mut csv = String::from("Item Name,Price\n");
        for i in 0..rows {
            csv.push_str(&format!("item{},{}.5\n", i, i));
        }
        let path = std::env::temp_dir()
            .join(format!("askdata_session_{}_{}.csv", std::process::id(), name));
        std::fs::write(&path, csv).unwrap();
        let table = Table::load(&path, &LoadOptions::default()).unwrap();
        std::fs::remove_file(path).ok();
        table
    }

    fn session<'a>(
        table: &'a Table,
        schema: &'a SchemaDescription,
        llm: ScriptedLlm,
    ) -> Session<'a, ScriptedLlm> {
        Session::new(table, schema, llm, SafetyGate::new(), 50, 3)
    }

    #[tokio::test]
    async fn test_count_rows() {
        let table = load_table("count", 13152);
        let schema = SchemaDescription::infer(&table, 10).unwrap();
        let s = session(&table, &schema, ScriptedLlm::new(&[Ok("SELECT COUNT(*) FROM data")]));

        let exchange = s.ask("How many rows are in the data?").await;
        let result = exchange.result.unwrap();
        assert_eq!(result.scalar(), Some(&json!(13152)));
    }

    #[tokio::test]
    async fn test_drop_is_blocked_then_table_still_works() {
        let table = load_table("drop", 4);
        let schema = SchemaDescription::infer(&table, 10).unwrap();
        let s = session(
            &table,
            &schema,
            ScriptedLlm::new(&[Ok("DROP TABLE data"), Ok("SELECT COUNT(*) FROM data")]),
        );

        let exchange = s.ask("drop it").await;
        assert_eq!(exchange.translation.unwrap().sql.as_str(), "DROP TABLE data");
        match exchange.result {
            Err(QuestionError::Blocked(e)) => assert_eq!(e.keyword(), Some("DROP")),
            other => panic!("expected blocked query, got {:?}", other),
        }

        let exchange = s.ask("count").await;
        assert_eq!(exchange.result.unwrap().scalar(), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_stacked_statement_is_blocked() {
        let table = load_table("stacked", 2);
        let schema = SchemaDescription::infer(&table, 10).unwrap();
        let s = session(
            &table,
            &schema,
            ScriptedLlm::new(&[Ok("SELECT * FROM data; DELETE FROM data")]),
        );

        let exchange = s.ask("everything").await;
        assert!(matches!(
            exchange.result,
            Err(QuestionError::Blocked(BlockedQueryError::StackedStatements))
        ));
    }

    #[tokio::test]
    async fn test_transcript_continues_after_errors() {
        let table = load_table("transcript", 3);
        let schema = SchemaDescription::infer(&table, 10).unwrap();
        let s = session(
            &table,
            &schema,
            ScriptedLlm::new(&[
                Err("not json"),
                Ok("SELECT foo FROM data"),
                Ok("DROP TABLE data"),
                Ok("SELECT item_name, price FROM data ORDER BY price DESC LIMIT 1"),
            ]),
        );

        let input = "q1\nq2\nq3\nmost expensive?\nexit\nnever asked\n".as_bytes();
        let mut out = Vec::new();
        let asked = s.run(input, &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert_eq!(asked, 4);
        assert!(out.starts_with("=== Data loaded ===\nTABLE: data (3 rows)"));
        assert!(out.contains("- item_name (text"));
        assert!(out.contains("[LLM error] Model did not return a usable JSON plan"));
        assert!(out.contains("[Generated SQL]\nSELECT foo FROM data"));
        assert!(out.contains("[Execution error]"));
        assert!(out.contains("foo"));
        assert!(out.contains("[Query blocked] blocked keyword: DROP"));
        assert!(out.contains("=== Result ==="));
        assert!(out.contains("item2"));
        assert!(out.contains("2.5"));
        assert!(out.trim_end().ends_with("Bye."));
    }

    #[tokio::test]
    async fn test_empty_line_ends_session() {
        let table = load_table("empty_line", 1);
        let schema = SchemaDescription::infer(&table, 10).unwrap();
        let s = session(&table, &schema, ScriptedLlm::new(&[]));

        let mut out = Vec::new();
        let asked = s.run("\nignored\n".as_bytes(), &mut out).await.unwrap();
        assert_eq!(asked, 0);
        assert!(String::from_utf8(out).unwrap().contains("Bye."));
    }

    #[tokio::test]
    async fn test_end_of_input_ends_session() {
        let table = load_table("eof", 1);
        let schema = SchemaDescription::infer(&table, 10).unwrap();
        let s = session(&table, &schema, ScriptedLlm::new(&[Ok("SELECT 1")]));

        let mut out = Vec::new();
        let asked = s.run("one\n".as_bytes(), &mut out).await.unwrap();
        assert_eq!(asked, 1);
    }

    #[tokio::test]
    async fn test_model_comment_is_printed() {
        let table = load_table("comment", 2);
        let schema = SchemaDescription::infer(&table, 10).unwrap();

        struct Commented;

        #[async_trait]
        impl Translator for Commented {
            async fn translate(
                &self,
                _question: &str,
                _schema: &SchemaDescription,
            ) -> Result<Translation, TranslationError> {
                let reply = r#"{"sql": "SELECT MAX(price) FROM data", "comment": "highest price"}"#;
                Ok(parse_plan(reply).unwrap())
            }
        }

        let s = Session::new(&table, &schema, Commented, SafetyGate::new(), 50, 3);
        let mut out = Vec::new();
        s.run("top price\nquit\n".as_bytes(), &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("[Comment] highest price"));
        assert!(out.contains("=== Result ===\n1.5\n"));
    }

    #[tokio::test]
    async fn test_intro_uses_configured_sample_count() {
        let table = load_table("samples", 6);
        let schema = SchemaDescription::infer(&table, 10).unwrap();

        let mut out = Vec::new();
        Session::new(&table, &schema, ScriptedLlm::new(&[]), SafetyGate::new(), 50, 1)
            .run("exit\n".as_bytes(), &mut out)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(r#"samples=["item0"]"#));

        let mut out = Vec::new();
        Session::new(&table, &schema, ScriptedLlm::new(&[]), SafetyGate::new(), 50, 5)
            .run("exit\n".as_bytes(), &mut out)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(r#"samples=["item0","item1","item2","item3","item4"]"#));
    }

    #[test]
    fn test_is_exit() {
        assert!(is_exit(""));
        assert!(is_exit("exit"));
        assert!(is_exit("QUIT"));
        assert!(!is_exit("exit strategy costs"));
    }
}

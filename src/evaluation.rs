use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const SCALE_MIN: i64 = 2;
pub const SCALE_MAX: i64 = 10;

/// Closed question-type enumeration. Anything else is rejected at
/// validation time, before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    Input,
    Dropdown,
    Likert,
    Checkbox,
}

impl QuestionKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "input" => Some(Self::Input),
            "dropdown" => Some(Self::Dropdown),
            "likert" => Some(Self::Likert),
            "checkbox" => Some(Self::Checkbox),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Dropdown => "dropdown",
            Self::Likert => "likert",
            Self::Checkbox => "checkbox",
        }
    }

    pub fn needs_options(self) -> bool {
        matches!(self, Self::Dropdown | Self::Checkbox)
    }

    pub fn needs_scale(self) -> bool {
        matches!(self, Self::Likert)
    }
}

/// One question as supplied by the template editor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub scale: Option<i64>,
    #[serde(default, alias = "sort_order")]
    pub sort_order: Option<i64>,
}

/// A stored, active question as read back from a template.
#[derive(Debug, Clone)]
pub struct Question {
    pub id: String,
    pub kind: QuestionKind,
    pub text: String,
    pub options: Vec<String>,
    pub scale: Option<i64>,
    pub sort_order: i64,
}

/// One member answer. The wire shape is the bare JSON value; which variant
/// is legal depends on the question kind it is paired with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    Scale(i64),
    Text(String),
    MultiChoice(Vec<String>),
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("question {index}: {message}")]
    InvalidQuestion { index: usize, message: String },
    #[error("answer for question {question_id} must be {expected}")]
    AnswerShape {
        question_id: String,
        expected: &'static str,
    },
    #[error("unknown question id {question_id}")]
    UnknownQuestion { question_id: String },
}

/// Validate an entire replacement batch. All-or-nothing: the first offending
/// spec fails the batch with its index, and the caller must not have written
/// anything yet.
pub fn validate_question_batch(specs: &[QuestionSpec]) -> Result<(), EvalError> {
    for (index, spec) in specs.iter().enumerate() {
        let kind = QuestionKind::parse(&spec.kind).ok_or_else(|| EvalError::InvalidQuestion {
            index,
            message: format!("unrecognized type '{}'", spec.kind),
        })?;
        if spec.text.trim().is_empty() {
            return Err(EvalError::InvalidQuestion {
                index,
                message: "text must not be empty".to_string(),
            });
        }
        if kind.needs_options() {
            match &spec.options {
                Some(options) if !options.is_empty() => {}
                _ => {
                    return Err(EvalError::InvalidQuestion {
                        index,
                        message: format!("{} requires a non-empty options array", kind.as_str()),
                    })
                }
            }
        }
        if kind.needs_scale() {
            match spec.scale {
                Some(s) if (SCALE_MIN..=SCALE_MAX).contains(&s) => {}
                _ => {
                    return Err(EvalError::InvalidQuestion {
                        index,
                        message: format!(
                            "likert requires a scale between {} and {}",
                            SCALE_MIN, SCALE_MAX
                        ),
                    })
                }
            }
        }
    }
    Ok(())
}

/// Check that every answer value has the shape its question's kind calls
/// for, and that every key references a question of the template. Draft
/// saves go through this too; only emptiness is deferred to submit time.
pub fn validate_answer_shapes(
    questions: &[Question],
    answers: &HashMap<String, Answer>,
) -> Result<(), EvalError> {
    let by_id: HashMap<&str, &Question> =
        questions.iter().map(|q| (q.id.as_str(), q)).collect();
    for (question_id, answer) in answers {
        let Some(question) = by_id.get(question_id.as_str()) else {
            return Err(EvalError::UnknownQuestion {
                question_id: question_id.clone(),
            });
        };
        let ok = match question.kind {
            QuestionKind::Input | QuestionKind::Dropdown => matches!(answer, Answer::Text(_)),
            QuestionKind::Checkbox => matches!(answer, Answer::MultiChoice(_)),
            QuestionKind::Likert => matches!(answer, Answer::Scale(_)),
        };
        if !ok {
            let expected = match question.kind {
                QuestionKind::Input | QuestionKind::Dropdown => "a string",
                QuestionKind::Checkbox => "an array of strings",
                QuestionKind::Likert => "an integer",
            };
            return Err(EvalError::AnswerShape {
                question_id: question_id.clone(),
                expected,
            });
        }
    }
    Ok(())
}

/// Submit-time required-field check. Collects every unmet requirement so the
/// member sees the full list in one round trip, not just the first failure.
pub fn missing_required(
    questions: &[Question],
    answers: &HashMap<String, Answer>,
) -> Vec<String> {
    let mut failures = Vec::new();
    for question in questions {
        let failure = match (question.kind, answers.get(&question.id)) {
            (QuestionKind::Input | QuestionKind::Dropdown, Some(Answer::Text(s))) => {
                if s.trim().is_empty() {
                    Some("answer must not be empty")
                } else {
                    None
                }
            }
            (QuestionKind::Checkbox, Some(Answer::MultiChoice(picks))) => {
                if picks.is_empty() {
                    Some("select at least one option")
                } else {
                    None
                }
            }
            (QuestionKind::Likert, Some(Answer::Scale(v))) => {
                let scale = question.scale.unwrap_or(SCALE_MAX);
                if (1..=scale).contains(v) {
                    None
                } else {
                    Some("rating out of range")
                }
            }
            // Absent, or the wrong shape slipped past an older client.
            (_, _) => Some("answer required"),
        };
        if let Some(message) = failure {
            failures.push(format!("{}: {}", question.text, message));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str, text: &str) -> QuestionSpec {
        QuestionSpec {
            kind: kind.to_string(),
            text: text.to_string(),
            options: None,
            scale: None,
            sort_order: None,
        }
    }

    fn question(id: &str, kind: QuestionKind, scale: Option<i64>) -> Question {
        Question {
            id: id.to_string(),
            kind,
            text: format!("Question {}", id),
            options: Vec::new(),
            scale,
            sort_order: 0,
        }
    }

    #[test]
    fn batch_rejects_unknown_kind() {
        let specs = vec![spec("input", "Name"), spec("slider", "Rate us")];
        let err = validate_question_batch(&specs).expect_err("slider is not a kind");
        assert!(err.to_string().contains("question 1"));
        assert!(err.to_string().contains("slider"));
    }

    #[test]
    fn batch_rejects_dropdown_without_options() {
        let specs = vec![spec("dropdown", "Pick one")];
        let err = validate_question_batch(&specs).expect_err("no options");
        assert!(err.to_string().contains("options"));

        let mut with_empty = spec("checkbox", "Pick many");
        with_empty.options = Some(Vec::new());
        let err = validate_question_batch(&[with_empty]).expect_err("empty options");
        assert!(err.to_string().contains("options"));
    }

    #[test]
    fn batch_rejects_likert_scale_out_of_range() {
        for bad in [None, Some(1), Some(11)] {
            let mut s = spec("likert", "Rate us");
            s.scale = bad;
            assert!(validate_question_batch(&[s]).is_err(), "scale {:?}", bad);
        }
        let mut ok = spec("likert", "Rate us");
        ok.scale = Some(5);
        assert!(validate_question_batch(&[ok]).is_ok());
    }

    #[test]
    fn batch_rejects_blank_text() {
        let specs = vec![spec("input", "   ")];
        assert!(validate_question_batch(&specs).is_err());
    }

    #[test]
    fn answer_shapes_follow_kind() {
        let questions = vec![
            question("q1", QuestionKind::Input, None),
            question("q2", QuestionKind::Checkbox, None),
            question("q3", QuestionKind::Likert, Some(5)),
        ];
        let mut answers = HashMap::new();
        answers.insert("q1".to_string(), Answer::Text("yes".to_string()));
        answers.insert(
            "q2".to_string(),
            Answer::MultiChoice(vec!["a".to_string()]),
        );
        answers.insert("q3".to_string(), Answer::Scale(4));
        assert!(validate_answer_shapes(&questions, &answers).is_ok());

        answers.insert("q3".to_string(), Answer::Text("four".to_string()));
        let err = validate_answer_shapes(&questions, &answers).expect_err("likert wants int");
        assert!(err.to_string().contains("q3"));
    }

    #[test]
    fn answer_to_retired_question_is_rejected_on_write() {
        let questions = vec![question("q1", QuestionKind::Input, None)];
        let mut answers = HashMap::new();
        answers.insert("gone".to_string(), Answer::Text("x".to_string()));
        assert!(validate_answer_shapes(&questions, &answers).is_err());
    }

    #[test]
    fn missing_required_reports_every_failure_in_one_pass() {
        let questions = vec![
            question("q1", QuestionKind::Input, None),
            question("q2", QuestionKind::Checkbox, None),
            question("q3", QuestionKind::Likert, Some(5)),
        ];
        let mut answers = HashMap::new();
        answers.insert("q1".to_string(), Answer::Text("".to_string()));
        answers.insert("q2".to_string(), Answer::MultiChoice(Vec::new()));
        answers.insert("q3".to_string(), Answer::Scale(6));

        let failures = missing_required(&questions, &answers);
        assert_eq!(failures.len(), 3);
    }

    #[test]
    fn likert_rating_must_start_at_one() {
        let questions = vec![question("q3", QuestionKind::Likert, Some(5))];
        let mut answers = HashMap::new();
        answers.insert("q3".to_string(), Answer::Scale(0));
        assert_eq!(missing_required(&questions, &answers).len(), 1);
        answers.insert("q3".to_string(), Answer::Scale(1));
        assert!(missing_required(&questions, &answers).is_empty());
    }

    #[test]
    fn untagged_answer_decodes_by_json_type() {
        let raw = serde_json::json!({
            "q1": "yes",
            "q2": ["opt1", "opt2"],
            "q3": 4
        });
        let answers: HashMap<String, Answer> = serde_json::from_value(raw).expect("decode");
        assert_eq!(answers["q1"], Answer::Text("yes".to_string()));
        assert_eq!(
            answers["q2"],
            Answer::MultiChoice(vec!["opt1".to_string(), "opt2".to_string()])
        );
        assert_eq!(answers["q3"], Answer::Scale(4));
    }
}

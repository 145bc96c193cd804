//! Wire shapes of the pipeline's payloads: the batch input we submit, the
//! batch output we get back, the processed Q/A artifact and the chat-format
//! training records stage 2 feeds the trainer.

use serde::{Deserialize, Serialize};

use crate::clients::openai::CHAT_COMPLETIONS_ENDPOINT;
use crate::clients::provider::{BatchRequest, BatchSubmission, ChatBody, ChatMessage};
use crate::clients::subjects::SubjectRecord;
use crate::error::PipelineError;
use crate::jobs::Job;

const MAX_TOKENS: u32 = 300;
const TEMPERATURE: f32 = 0.8;

pub const QUESTION_TOPICS: [&str; 15] = [
    "일상생활과 취미",
    "패션과 뷰티",
    "여행과 맛집",
    "연애와 관계",
    "직업과 커리어",
    "건강과 운동",
    "문화와 엔터테인먼트",
    "소셜미디어와 트렌드",
    "자기계발과 성장",
    "가족과 친구들",
    "쇼핑과 소비",
    "음식과 요리",
    "스트레스와 힐링",
    "미래와 꿈",
    "추억과 경험",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub custom_id: Option<String>,
}

/// Body of the `processed_result` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub job_id: String,
    pub subject_id: String,
    pub qa_pairs: Vec<QaPair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub messages: Vec<ChatMessage>,
}

// ----------------------------
// Prompts
// ----------------------------

/// System prompt that makes the batch model answer in the persona's voice.
pub fn persona_prompt(subject: &SubjectRecord) -> String {
    let mut p = format!(
        "당신은 다음과 같은 캐릭터로 답변해주세요:\n\n캐릭터 정보:\n- 이름: {}\n- 설명: {}\n- 성격: {}\n",
        subject.name, subject.description, subject.personality
    );
    if let Some(mbti) = &subject.mbti {
        p.push_str(&format!("- MBTI: {mbti}\n"));
    }
    if let Some(style) = &subject.speech_style {
        p.push_str(&format!("- 말투: {style}\n"));
    }
    p.push_str(
        "\n답변 시 주의사항:\n\
         1. 위 캐릭터의 성격과 특성을 반영하여 답변하세요.\n\
         2. 친구와 대화하듯 따뜻하고 친근한 말투를 사용해주세요.\n\
         3. 일관된 캐릭터와 어조를 유지하며 답변하세요.",
    );
    p
}

/// System message of every training record.
pub fn training_system_message(subject: &SubjectRecord) -> String {
    let mut m = format!(
        "당신은 {}입니다.\n\n성격과 특징:\n{}\n\n",
        subject.name, subject.personality
    );
    if let Some(style) = &subject.speech_style {
        m.push_str(&format!("스타일 정보:\n{style}\n\n"));
    }
    m.push_str(
        "이 캐릭터의 성격과 말투를 완벽하게 재현하여 답변해주세요.\n\
         - 항상 캐릭터의 개성이 드러나도록 답변하세요\n\
         - 일관된 말투와 어조를 유지하세요",
    );
    m
}

fn topic_instruction(topic: &str) -> String {
    format!(
        "'{topic}' 주제에 대한 자연스러운 질문을 하나 만들고, 당신의 캐릭터와 말투로 답변해주세요. 형식: Q: [질문] A: [답변]"
    )
}

/// One request per expected unit, topics taken round-robin so a
/// resubmission produces byte-identical input.
pub fn build_submission(job: &Job, subject: &SubjectRecord, model: &str) -> BatchSubmission {
    let system = persona_prompt(subject);
    let n = job.expected_units.max(0) as usize;

    let requests = (0..n)
        .map(|i| BatchRequest {
            custom_id: format!("{}-{}", job.job_id, i + 1),
            method: "POST".to_string(),
            url: CHAT_COMPLETIONS_ENDPOINT.to_string(),
            body: ChatBody {
                model: model.to_string(),
                messages: vec![
                    ChatMessage::system(system.clone()),
                    ChatMessage::user(topic_instruction(QUESTION_TOPICS[i % QUESTION_TOPICS.len()])),
                ],
                max_tokens: MAX_TOKENS,
                temperature: TEMPERATURE,
            },
        })
        .collect();

    BatchSubmission {
        job_id: job.job_id.clone(),
        subject_id: job.subject_id.clone(),
        requests,
    }
}

// ----------------------------
// Batch output
// ----------------------------

#[derive(Debug, Deserialize)]
struct OutputLine {
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    response: Option<OutputResponse>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    status_code: u16,
    #[serde(default)]
    body: Option<OutputBody>,
}

#[derive(Debug, Deserialize)]
struct OutputBody {
    #[serde(default)]
    choices: Vec<OutputChoice>,
}

#[derive(Debug, Deserialize)]
struct OutputChoice {
    message: OutputMessage,
}

#[derive(Debug, Deserialize)]
struct OutputMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Split `Q: ... A: ...` into its two halves.
pub fn split_qa(content: &str) -> Option<(String, String)> {
    if !content.contains("Q:") {
        return None;
    }
    let (q, a) = content.split_once("A:")?;
    let question = q.replace("Q:", "").trim().to_string();
    let answer = a.trim().to_string();
    if question.is_empty() || answer.is_empty() {
        return None;
    }
    Some((question, answer))
}

/// Parse a JSONL batch output. Lines that are not valid JSON, did not
/// return 200, or lack the Q/A shape are dropped.
pub fn parse_batch_output(raw: &[u8]) -> Vec<QaPair> {
    let text = String::from_utf8_lossy(raw);
    let mut skipped = 0usize;
    let mut out = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let pair = serde_json::from_str::<OutputLine>(line)
            .ok()
            .and_then(|l| {
                let resp = l.response?;
                if resp.status_code != 200 {
                    return None;
                }
                let content = resp.body?.choices.into_iter().next()?.message.content?;
                let (question, answer) = split_qa(&content)?;
                Some(QaPair {
                    question,
                    answer,
                    custom_id: l.custom_id,
                })
            });

        match pair {
            Some(p) => out.push(p),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::debug!(kept = out.len(), skipped, "dropped unusable batch output lines");
    }
    out
}

/// Read a `processed_result` artifact. Accepts the wrapped form and a bare
/// list of pairs.
pub fn parse_processed(raw: &[u8]) -> Result<Vec<QaPair>, PipelineError> {
    if let Ok(p) = serde_json::from_slice::<ProcessedResult>(raw) {
        return Ok(p.qa_pairs);
    }
    serde_json::from_slice::<Vec<QaPair>>(raw)
        .map_err(|e| PipelineError::Parse(format!("processed result: {e}")))
}

// ----------------------------
// Training data
// ----------------------------

pub fn training_records(subject: &SubjectRecord, pairs: &[QaPair]) -> Vec<TrainingRecord> {
    let system = training_system_message(subject);
    pairs
        .iter()
        .filter_map(|p| {
            let q = p.question.trim();
            let a = p.answer.trim();
            if q.is_empty() || a.is_empty() {
                return None;
            }
            Some(TrainingRecord {
                messages: vec![
                    ChatMessage::system(system.clone()),
                    ChatMessage::user(q),
                    ChatMessage::assistant(a),
                ],
            })
        })
        .collect()
}

pub fn to_jsonl<T: Serialize>(items: &[T]) -> Result<String, PipelineError> {
    let mut out = String::new();
    for item in items {
        let line = serde_json::to_string(item).map_err(|e| PipelineError::Parse(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Model repository for a subject, `<namespace>/<safe id>-finetuned`.
pub fn repo_id(namespace: &str, subject_id: &str) -> String {
    let safe: String = subject_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>()
        .to_lowercase();
    let safe = if safe.is_empty() { "subject".to_string() } else { safe };
    format!("{namespace}/{safe}-finetuned")
}

//! 提示词模板
//!
//! 模板按原样内嵌，占位符用 [HISTORIES] / [DOCS] / [QUERY] 这类方括号标记，
//! 渲染就是纯文本替换。生成三条检索词 / 三条追问的模板要求模型把输出
//! 包在 <QUERY_n> / <QUESTION_n> 标签里，这里也提供对应的抽取函数。

use regex::Regex;

use crate::intents::IntentRegistry;

/// 意图分类模板，渲染时注入意图清单
const INTENT_PROMPT_TEMPLATE: &str = r#"
Your task is to extract relevant information from the user's input and chat history to match one of the intentions outlined below. The user's input is in Vietnamese.

Please output the matched intention in JSON format as follows:
{
  "INTENT_NAME": <INTENT_NAME>,
  "REPHRASED_INTENT": "<rephrase the INPUT in Vietnamese, starting with 'Bạn muốn'/'Bạn cần'/'Bạn'>"
}

Do not include any clarifying information or additional text.

List of intentions:
<INTENT_NAME>: <DESCRIPTION>
[INTENTS]

Chat histories:
[HISTORIES]
NO YAPPING
"#;

/// 一次生成三条检索词
pub const SEARCH_QUERY_BREAKDOWN_PROMPT_TEMPLATE: &str = r#"
Your goal is to generate THREE different prompts from the user's input and chat histories that contains all the information described below.
These prompts are used as queries in a vetor store. The output must be warped between tags:

<QUERY_1></QUERY_1>
<QUERY_2></QUERY_2>
<QUERY_3></QUERY_3>

Please only output the question contained the information related to user's input and use the same language of user's input.
Do not output anything except for the prompt. Do not add any clarifying information. Output must be in text format and follow the intruction specified above.

Chat histories:
[HISTORIES]
"#;

pub const RANKING_DOCS_SYSTEM_PROMPT_TEMPLATE: &str = r#"
### Task:
Rank the relevance of each chunk based on the query.

### Guide:
1. Review the conversation history to understand the context of the query and its connection to the chunks.
2. Carefully evaluate each chunk to determine how well it aligns with the provided query in light of the conversation history.
3. Use the scoring criteria below to assign a relevance score to each chunk.
4. Ensure the output follows the specified JSON format.

### Scoring Criteria:
1: Not relevant - The chunk does not address or relate to the query.
2: Somewhat relevant - The chunk has limited relevance with only minor points connecting to the query.
3: Moderately relevant - The chunk has a fair amount of relevance with several points aligning with the query.
4: Mostly relevant - The chunk addresses the query closely but may miss a few minor points.
5: Fully relevant - The chunk directly and comprehensively addresses all aspects of the query.

### Output format (JSON):
{
"chunks": [
    {
    "score": <relevance_score>,
    "chunk_id": <chunk_id>
    }
]
}
"#;

pub const RANKING_DOCS_USER_PROMPT_TEMPLATE: &str = r#"
### Conversation History:
[HISTORIES]

### List of Chunks:
[DOCS]

### Query:
[QUERY]
"#;

pub const ANSWER_PROMPT_TEMPLATE: &str = r#"
You are an admissions consultant for the Vietnam National University Ho Chi Minh City.
The following information is provided:
Context:
[DOCS]

Chat histories:
[HISTORIES]

Please answer the user's question using the information available in the provided context. If the context lacks sufficient information, make a reasonable attempt to address the query based on relevant knowledge or logical inference. If no suitable answer can be provided, state: "Dữ liệu về chưa được cung cấp, tuy nhiên yêu cầu của bạn đã được ghi nhận."
Keep responses clear and concise.
"#;

pub const FOLLOWUP_QUESTIONS_PROMPT_TEMPLATE: &str = r#"
Your goal is generate THREE DIFFERENT follow-up questions from the user's input, the answer and chat histories.
The output must be warped between tags:
<QUESTION_1></QUESTION_1>
<QUESTION_2></QUESTION_2>
<QUESTION_3></QUESTION_3>

Please only output follow-up questions that contained all related information and will be asked by the user.
Do not output anything except for three follow-up questions. Do not add any clarifying information. Output must be in text format and follow the intruction specified above.
NO YAPPING

User's input:
[SEARCH_TERM]
Answer:
[ANSWER]
Chat histories:
[HISTORIES]
"#;

/// 渲染意图分类系统提示词
pub fn intent_prompt(registry: &IntentRegistry, histories: &str) -> String {
    INTENT_PROMPT_TEMPLATE
        .replace("[INTENTS]", &registry.prompt_block())
        .replace("[HISTORIES]", histories)
}

pub fn search_query_prompt(histories: &str) -> String {
    SEARCH_QUERY_BREAKDOWN_PROMPT_TEMPLATE.replace("[HISTORIES]", histories)
}

pub fn ranking_user_prompt(histories: &str, docs: &str, query: &str) -> String {
    RANKING_DOCS_USER_PROMPT_TEMPLATE
        .replace("[HISTORIES]", histories)
        .replace("[DOCS]", docs)
        .replace("[QUERY]", query)
}

pub fn answer_prompt(docs: &str, histories: &str) -> String {
    ANSWER_PROMPT_TEMPLATE
        .replace("[DOCS]", docs)
        .replace("[HISTORIES]", histories)
}

pub fn followup_prompt(search_term: &str, answer: &str, histories: &str) -> String {
    FOLLOWUP_QUESTIONS_PROMPT_TEMPLATE
        .replace("[SEARCH_TERM]", search_term)
        .replace("[ANSWER]", answer)
        .replace("[HISTORIES]", histories)
}

/// 抽取 <QUERY_1>..<QUERY_3> 标签里的检索词，空内容跳过
pub fn extract_queries(raw: &str) -> Vec<String> {
    extract_tagged(raw, "QUERY")
}

/// 抽取 <QUESTION_1>..<QUESTION_3> 标签里的追问
pub fn extract_questions(raw: &str) -> Vec<String> {
    extract_tagged(raw, "QUESTION")
}

fn extract_tagged(raw: &str, tag: &str) -> Vec<String> {
    let mut out = Vec::new();
    for i in 1..=3 {
        let pattern = format!(r"(?s)<{tag}_{i}>(.*?)</{tag}_{i}>");
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if let Some(cap) = re.captures(raw) {
            let text = cap[1].trim();
            if !text.is_empty() {
                out.push(text.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_prompt_injects_registry() {
        let registry = IntentRegistry::from_json_str(
            r#"{"hoc_phi": {"DESCRIPTION": "Hỏi về học phí", "ACTION": {"CMD": "SEARCH_DOCS", "DB": "tuyensinh"}}}"#,
        )
        .unwrap();
        let prompt = intent_prompt(&registry, "user: xin chào");
        assert!(prompt.contains("'hoc_phi': 'Hỏi về học phí'"));
        assert!(prompt.contains("user: xin chào"));
        assert!(!prompt.contains("[INTENTS]"));
        assert!(!prompt.contains("[HISTORIES]"));
    }

    #[test]
    fn test_extract_queries() {
        let raw = "<QUERY_1>Học phí ngành CNTT</QUERY_1>\n<QUERY_2> Học bổng </QUERY_2>\n<QUERY_3></QUERY_3>";
        let queries = extract_queries(raw);
        assert_eq!(queries, vec!["Học phí ngành CNTT", "Học bổng"]);
    }

    #[test]
    fn test_extract_questions_multiline() {
        let raw = "<QUESTION_1>Điểm chuẩn\nnăm ngoái?</QUESTION_1><QUESTION_2>Ký túc xá?</QUESTION_2><QUESTION_3>Học bổng?</QUESTION_3>";
        let questions = extract_questions(raw);
        assert_eq!(questions.len(), 3);
        assert_eq!(questions[0], "Điểm chuẩn\nnăm ngoái?");
    }
}

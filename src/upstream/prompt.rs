//! Prompt construction for the two analyzer phases.
//!
//! The few-shot pairs calibrate the model's scale for every vector the
//! service produces.

use serde_json::json;

use super::transport::ChatMessage;
use crate::models::{AnalysisContext, ContentVector};

const PHASE1_SYSTEM: &str = "You analyze short social media posts for political framing and reasoning quality.\n\
Score the post on three axes, each a number from -1.0 to 1.0:\n\
- social: -1.0 strongly progressive .. 1.0 strongly traditionalist\n\
- economic: -1.0 strongly redistributive .. 1.0 strongly free-market\n\
- populist: -1.0 institutionalist/technocratic .. 1.0 anti-elite populist\n\
List logical fallacies the post commits using standard names such as \"Ad Hominem\", \"Straw Man\", \
\"False Dilemma\", \"Slippery Slope\", \"Appeal to Fear\", \"Whataboutism\", \"Hasty Generalization\", \
\"Bandwagon\", \"Appeal to Authority\", \"Red Herring\", \"Cherry Picking\". Use an empty list when there are none.\n\
Give a short lowercase topic label and your confidence from 0.0 to 1.0.\n\
Output raw JSON only, no markdown, exactly this shape:\n\
{\"vector\":{\"social\":0.0,\"economic\":0.0,\"populist\":0.0},\"fallacies\":[],\"topic\":\"\",\"confidence\":0.0}";

const PHASE2_SYSTEM: &str = "You help a reader think critically about a social media post.\n\
Write for a reader whose own leanings are given. Be fair, concrete and brief (one or two sentences per field).\n\
Output raw JSON only, no markdown, with exactly these string fields:\n\
{\"counterArgument\":\"\",\"logicFailure\":\"\",\"claim\":\"\",\"mechanism\":\"\",\"dataCheck\":\"\",\"socraticChallenge\":\"\"}";

fn post_block(text: &str) -> String {
    format!("Post:\n\"\"\"\n{}\n\"\"\"", text)
}

fn phase1_examples() -> Vec<(&'static str, serde_json::Value)> {
    vec![
        (
            "Either we close the border today or this country is finished. Wake up!",
            json!({
                "vector": {"social": 0.6, "economic": 0.1, "populist": 0.7},
                "fallacies": ["False Dilemma", "Appeal to Fear"],
                "topic": "immigration",
                "confidence": 0.82
            }),
        ),
        (
            "The central bank raised its policy rate by 0.25 points today, citing persistent services inflation.",
            json!({
                "vector": {"social": 0.0, "economic": 0.1, "populist": -0.3},
                "fallacies": [],
                "topic": "monetary policy",
                "confidence": 0.9
            }),
        ),
        (
            "Of course the senator opposes a wealth tax, she's a corrupt career politician like the rest of them.",
            json!({
                "vector": {"social": -0.2, "economic": -0.6, "populist": 0.8},
                "fallacies": ["Ad Hominem", "Hasty Generalization"],
                "topic": "taxation",
                "confidence": 0.77
            }),
        ),
    ]
}

/// Phase 1: content vector, fallacies, topic, confidence
pub fn phase1_messages(text: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(PHASE1_SYSTEM)];
    for (post, answer) in phase1_examples() {
        messages.push(ChatMessage::user(post_block(post)));
        messages.push(ChatMessage::assistant(answer.to_string()));
    }
    messages.push(ChatMessage::user(post_block(text)));
    messages
}

fn describe_vector(v: &ContentVector) -> String {
    format!(
        "social {:.2}, economic {:.2}, populist {:.2}",
        v.social, v.economic, v.populist
    )
}

/// Phase 2: per-reader deep dive, grounded on the Phase 1 result when available
pub fn phase2_messages(text: &str, context: Option<&AnalysisContext>) -> Vec<ChatMessage> {
    let example_answer = json!({
        "counterArgument": "Border policy involves many options between full closure and no enforcement, such as visa reform or asylum processing capacity.",
        "logicFailure": "False dilemma: it presents two extremes as the only choices.",
        "claim": "Immediate border closure is the only way to prevent national collapse.",
        "mechanism": "Urgency and fear push the reader to accept the extreme option without weighing alternatives.",
        "dataCheck": "Compare official border crossing statistics over several years before accepting the 'finished' framing.",
        "socraticChallenge": "What outcome would convince you that a middle-ground policy was working?"
    });

    let mut messages = vec![
        ChatMessage::system(PHASE2_SYSTEM),
        ChatMessage::user(format!(
            "{}\nDetected fallacies: False Dilemma, Appeal to Fear\nReader leaning: social 0.40, economic 0.20, populist 0.50",
            post_block("Either we close the border today or this country is finished. Wake up!")
        )),
        ChatMessage::assistant(example_answer.to_string()),
    ];

    let mut prompt = post_block(text);
    if let Some(ctx) = context {
        if let Some(phase1) = &ctx.phase1 {
            let fallacies = if phase1.fallacies.is_empty() {
                "none".to_string()
            } else {
                phase1.fallacies.join(", ")
            };
            prompt.push_str(&format!(
                "\nTopic: {}\nDetected fallacies: {}\nPost leaning: {}",
                phase1.topic,
                fallacies,
                describe_vector(&phase1.vector)
            ));
        }
        if let Some(user) = &ctx.user_vector {
            prompt.push_str(&format!("\nReader leaning: {}", describe_vector(user)));
        }
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase1Analysis;

    #[test]
    fn phase1_ends_with_the_post() {
        let messages = phase1_messages("Taxes are theft");
        assert_eq!(messages[0].role, "system");
        // system + 3 example pairs + post
        assert_eq!(messages.len(), 8);
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert!(last.content.contains("Taxes are theft"));
    }

    #[test]
    fn phase1_is_deterministic() {
        assert_eq!(phase1_messages("same input"), phase1_messages("same input"));
    }

    #[test]
    fn phase2_includes_context() {
        let ctx = AnalysisContext {
            phase1: Some(Phase1Analysis {
                vector: ContentVector::new(0.2, 0.1, -0.1),
                fallacies: vec!["False Dilemma".into()],
                topic: "topic-3".into(),
                confidence: 0.73,
            }),
            user_vector: Some(ContentVector::new(-0.5, 0.0, 0.0)),
            api_key: None,
        };
        let messages = phase2_messages("post body", Some(&ctx));
        let last = &messages.last().unwrap().content;
        assert!(last.contains("Topic: topic-3"));
        assert!(last.contains("Detected fallacies: False Dilemma"));
        assert!(last.contains("Reader leaning: social -0.50"));
    }
}

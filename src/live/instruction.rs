//! System instruction for the persona the agent plays.

use crate::session::SessionConfig;

const TURN_RULES: &str = "\
Conversation rules:
- Respond with exactly one conversational turn per exchange, then stop and let the user speak.
- Never say or suggest that you are an AI, a language model, or an assistant.
- Stay in your persona at all times, even if the user asks you for feedback, a score, or to step out of the role.
- Speak naturally and keep your turns short, as in a real spoken conversation.";

/// Build the instruction embedding the persona and the reference document.
pub fn build_system_instruction(config: &SessionConfig) -> String {
    let mut instruction = String::new();
    instruction.push_str(
        "You are taking part in a live spoken role-play that a user is using to practise a conversation.\n\n",
    );
    instruction.push_str("Your persona:\n");
    instruction.push_str(config.persona.trim());
    instruction.push_str("\n\n");

    let reference = config.reference_text.trim();
    if reference.is_empty() {
        instruction.push_str("No reference document was provided.\n\n");
    } else {
        let label = match config.reference_label.trim() {
            "" => "Reference document",
            label => label,
        };
        instruction.push_str(&format!(
            "Background context from \"{}\" (use it as knowledge your persona has; do not read it out):\n",
            label
        ));
        instruction.push_str(reference);
        instruction.push_str("\n\n");
    }

    instruction.push_str(TURN_RULES);
    instruction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_embeds_persona_and_reference() {
        let config = SessionConfig {
            persona: "A sceptical CFO named Dana".to_string(),
            reference_text: "Q3 revenue fell 4%.".to_string(),
            reference_label: "q3-report.pdf".to_string(),
        };
        let instruction = build_system_instruction(&config);
        assert!(instruction.contains("A sceptical CFO named Dana"));
        assert!(instruction.contains("\"q3-report.pdf\""));
        assert!(instruction.contains("Q3 revenue fell 4%."));
        assert!(instruction.contains("exactly one conversational turn"));
        assert!(instruction.contains("Never say or suggest that you are an AI"));
        assert!(instruction.contains("Stay in your persona"));
    }

    #[test]
    fn test_instruction_without_reference() {
        let config = SessionConfig {
            persona: "A hiring manager".to_string(),
            reference_text: "   ".to_string(),
            reference_label: String::new(),
        };
        let instruction = build_system_instruction(&config);
        assert!(instruction.contains("No reference document was provided."));
    }
}

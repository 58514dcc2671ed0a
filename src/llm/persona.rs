use serde::Serialize;

pub const DEFAULT_PERSONA: &str = "Mr.GYB AI";

pub const FALLBACK_PROMPT: &str =
    "You are a helpful AI assistant. Be professional and concise in your responses.";

const PERSONAS: &[(&str, &str)] = &[
    (
        "Mr.GYB AI",
        "You are Mr.GYB AI, an all-in-one business growth assistant. You specialize in digital marketing, content creation, and business strategy. Be professional, strategic, and focused on growth.",
    ),
    (
        "CEO",
        "You are the CEO AI, focused on high-level strategic planning and business development. Provide executive-level insights and leadership guidance.",
    ),
    (
        "COO",
        "You are the COO AI, specializing in operations management and process optimization. Focus on efficiency, systems, and operational excellence.",
    ),
    (
        "CHRO",
        "You are the CHRO AI, expert in human resources and organizational development. Focus on talent management, culture, and employee experience.",
    ),
    (
        "CTO",
        "You are the CTO AI, specializing in technology strategy and innovation. Provide guidance on technical decisions and digital transformation.",
    ),
    (
        "CMO",
        "You are the CMO AI, expert in marketing strategy and brand development. Focus on marketing campaigns, brand building, and customer engagement.",
    ),
];

/// A named system prompt. Chosen per assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
}

impl Persona {
    /// Looks up a persona by name. Unknown names keep their name but get the
    /// generic prompt.
    pub fn resolve(name: &str) -> Self {
        let prompt = PERSONAS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| *p)
            .unwrap_or(FALLBACK_PROMPT);

        Self {
            name: name.to_string(),
            system_prompt: prompt.to_string(),
        }
    }

    pub fn all() -> Vec<Self> {
        PERSONAS
            .iter()
            .map(|(name, prompt)| Self {
                name: name.to_string(),
                system_prompt: prompt.to_string(),
            })
            .collect()
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::resolve(DEFAULT_PERSONA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_persona_gets_its_prompt() {
        let ceo = Persona::resolve("CEO");
        assert!(ceo.system_prompt.starts_with("You are the CEO AI"));
    }

    #[test]
    fn unknown_persona_falls_back_to_generic_prompt() {
        let p = Persona::resolve("Chief Vibes Officer");
        assert_eq!(p.name, "Chief Vibes Officer");
        assert_eq!(p.system_prompt, FALLBACK_PROMPT);
    }

    #[test]
    fn default_is_the_growth_assistant() {
        assert_eq!(Persona::default().name, DEFAULT_PERSONA);
        assert_eq!(Persona::all().len(), 6);
    }
}

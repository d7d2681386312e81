//! Supervisor (PI) name extraction from free posting text.
//!
//! Extraction is an ordered list of independent [`NameMatcher`]s; the first
//! one that yields a plausible name wins. Role labels ("Supervisor:", "PI:")
//! are tried before weaker contextual forms such as "the X Lab".

use regex::Regex;

use crate::MatchingError;

/// Academic title prefix: "Prof.", "Dr.", "Prof. Dr.", "Assoc. Prof.", "dr hab.".
const TITLE: &str = r"(?i:(?:Prof(?:essor)?\.?\s+Dr\.?\s+|dr\s+hab\.?\s+|(?:Prof(?:essor)?|Dr|Assoc\.?\s*Prof|Asst\.?\s*Prof)\.?\s+))";
const FIRST: &str = r"\p{Lu}\p{Ll}+";
const MID: &str = r"(?:\s+\p{Lu}\.?)?";
const LAST: &str = r"\p{Lu}\p{Ll}+(?:-\p{Lu}\p{Ll}+)?";
const LAB_WORD: &str = r"(?i:lab(?:orator(?:y|ies))?|group|team)";

fn full_name() -> String {
    format!(r"({FIRST}{MID}\s+{LAST})")
}

fn title_opt() -> String {
    format!("(?:{TITLE})?")
}

/// One extraction strategy.
pub trait NameMatcher: Send + Sync {
    fn label(&self) -> &'static str;

    fn find(&self, text: &str) -> Option<String>;
}

/// Regex strategy: capture group 1 holds the name; candidates are validated
/// and the first valid one in text order is returned.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    label: &'static str,
    regex: Regex,
}

impl RegexMatcher {
    pub fn new(label: &'static str, pattern: &str) -> Result<Self, MatchingError> {
        let regex = Regex::new(pattern).map_err(|source| MatchingError::InvalidPattern {
            label: label.to_string(),
            source,
        })?;
        Ok(Self { label, regex })
    }
}

impl NameMatcher for RegexMatcher {
    fn label(&self) -> &'static str {
        self.label
    }

    fn find(&self, text: &str) -> Option<String> {
        self.regex
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| strip_titles(m.as_str()))
            .find(|name| is_valid_name(name))
    }
}

fn default_patterns() -> Vec<(&'static str, String)> {
    let name = full_name();
    let title_opt = title_opt();
    vec![
        (
            "role-label",
            format!(
                r"\b(?i:PI|Principal\s+Investigator|Supervisor|Advisor|Adviser|Project\s+(?:leader|coordinator)|Program\s+Coordinator|Reporting\s+to|Head\s+of\s+(?:programme|project))\b\s*[:=\-]?\s*{title_opt}{name}"
            ),
        ),
        (
            "about-the-pi",
            format!(r"(?i:about\s+the\s+(?:PI|supervisor|mentor|advisor|adviser))\s*:\s*{title_opt}{name}"),
        ),
        (
            "lab-of",
            format!(r"{LAB_WORD}\s+(?i:of|led\s+by|headed\s+by|directed\s+by)\s+{title_opt}{name}"),
        ),
        (
            "supervision-of",
            format!(r"(?i:supervision|direction|guidance|mentorship)\s+(?i:of)\s+{title_opt}{name}"),
        ),
        (
            "supervised-by",
            format!(r"(?i:directed|headed|led|managed|run|supervised|mentored)\s+(?i:by)\s+{title_opt}{name}"),
        ),
        (
            "possessive-lab",
            format!(r"{TITLE}{name}(?:'s|’s)?\s+(?:{LAB_WORD}|(?i:research))"),
        ),
        (
            "possessive-lab-untitled",
            format!(r"{name}(?:'s|’s)\s+{LAB_WORD}"),
        ),
        (
            "contact",
            format!(
                r"(?i:contact|inquiries|inquiry|questions?|directed\s+to)\s*:?\s*{title_opt}{name}\s*(?:(?i:at)\b|@|\(|\[at\])"
            ),
        ),
        (
            "group-leader",
            format!(
                r"(?i:group\s+leader|faculty\s+(?:mentor|advisor|adviser|sponsor)|lab(?:oratory)?\s+(?:director|head|manager))\s*[:,]?\s*{title_opt}{name}"
            ),
        ),
        (
            "join",
            format!(r"(?i:join|work\s+with|collaborate\s+with)\s+{TITLE}{name}"),
        ),
        (
            "in-the-lab",
            format!(r"(?i:in\s+the)\s+{title_opt}{name}\s+{LAB_WORD}\b"),
        ),
        (
            "named-lab",
            format!(r"{name}\s+(?i:lab(?:oratory)?|group|team)\b"),
        ),
    ]
}

/// Ordered first-success extractor.
pub struct PiNameExtractor {
    matchers: Vec<Box<dyn NameMatcher>>,
}

impl PiNameExtractor {
    pub fn new() -> Result<Self, MatchingError> {
        let matchers = default_patterns()
            .into_iter()
            .map(|(label, pattern)| {
                RegexMatcher::new(label, &pattern).map(|m| Box::new(m) as Box<dyn NameMatcher>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matchers })
    }

    pub fn with_matchers(matchers: Vec<Box<dyn NameMatcher>>) -> Self {
        Self { matchers }
    }

    pub fn matcher_labels(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.label()).collect()
    }

    pub fn extract(&self, text: &str) -> Option<String> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return None;
        }
        self.matchers.iter().find_map(|m| {
            let found = m.find(&normalized);
            if let Some(name) = &found {
                tracing::trace!(matcher = m.label(), name = %name, "pi name matched");
            }
            found
        })
    }
}

impl std::fmt::Debug for PiNameExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiNameExtractor")
            .field("matchers", &self.matcher_labels())
            .finish()
    }
}

const TITLE_TOKENS: &[&str] = &["prof", "prof.", "professor", "dr", "dr.", "assoc.", "asst.", "hab."];

fn strip_titles(name: &str) -> String {
    name.split_whitespace()
        .skip_while(|word| TITLE_TOKENS.contains(&word.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

const FALSE_POSITIVE_NAMES: &[&str] = &[
    "the university",
    "our group",
    "the lab",
    "the department",
    "the candidate",
    "the project",
    "the institute",
    "new york",
    "san francisco",
    "los angeles",
    "united states",
    "hong kong",
    "for more",
    "to apply",
    "start date",
    "more information",
    "full time",
    "part time",
    "stem cell",
    "immune cell",
    "machine learning",
    "deep learning",
    "mass spectrometry",
    "electron microscopy",
    "signal transduction",
    "precision medicine",
    "regenerative medicine",
    "climate change",
    "global health",
    "public health",
    "join our",
];

const NON_NAME_STARTERS: &[&str] = &[
    "the", "a", "an", "this", "that", "our", "their", "his", "her", "about", "new", "full",
    "part", "more", "all", "any", "each", "lead", "apply", "research", "senior", "junior",
    "assistant", "associate", "postdoctoral", "postdoc", "fellow", "position", "data", "cell",
    "gene", "protein", "biological", "biomedical", "clinical", "computational", "molecular",
    "synthetic", "structural", "functional", "advanced", "applied", "medical", "chemical",
    "physical", "national", "international", "global", "european", "american", "marine",
    "plant", "human", "tissue", "stem", "drug", "machine", "deep", "quantum", "digital",
    "professor", "phd", "principal", "world", "news", "summer", "spring", "winter",
];

const SCIENCE_WORDS: &[&str] = &[
    "biology", "chemistry", "physics", "engineering", "medicine", "science", "sciences",
    "research", "studies", "technology", "bioinformatics", "genomics", "proteomics",
    "immunology", "neuroscience", "oncology", "pathology", "pharmacology", "physiology",
    "biochemistry", "biophysics", "microbiology", "ecology", "genetics", "epigenetics",
    "field", "development", "discovery", "learning", "microscopy", "imaging", "university",
    "institute", "department", "systems",
];

const LINKING_WORDS: &[&str] = &["and", "from", "with", "at", "the", "for", "or", "in", "on", "of"];

/// Reject captures that are field names, places or boilerplate rather than people.
pub fn is_valid_name(name: &str) -> bool {
    let trimmed = name.trim();
    let lower = trimmed.to_lowercase();
    if trimmed.chars().count() < 4 || !trimmed.contains(' ') {
        return false;
    }
    if !trimmed.chars().next().is_some_and(char::is_uppercase) {
        return false;
    }
    if FALSE_POSITIVE_NAMES.contains(&lower.as_str()) {
        return false;
    }

    let words: Vec<String> = lower
        .split_whitespace()
        .map(|w| w.trim_end_matches(['.', ',', ';', ':']).to_string())
        .collect();
    let Some(first) = words.first() else {
        return false;
    };
    if NON_NAME_STARTERS.contains(&first.as_str()) {
        return false;
    }
    if words.iter().any(|w| SCIENCE_WORDS.contains(&w.as_str())) {
        return false;
    }
    if words.get(1).is_some_and(|w| LINKING_WORDS.contains(&w.as_str())) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn extractor() -> PiNameExtractor {
        PiNameExtractor::new().expect("default patterns compile")
    }

    #[test]
    fn supervisor_label_strips_title() {
        assert_eq!(
            extractor().extract("Supervisor: Dr. Jane Smith").as_deref(),
            Some("Jane Smith")
        );
    }

    #[test]
    fn role_labels_take_priority_over_weaker_forms() {
        let text = "Work in the Miller Lab on yeast genetics. PI: Prof. Dr. Karl Heinz-Becker";
        assert_eq!(extractor().extract(text).as_deref(), Some("Karl Heinz-Becker"));
    }

    #[test]
    fn contextual_forms_are_recognized() {
        let cases = [
            ("The laboratory of Prof. Anna Keller seeks a postdoc.", "Anna Keller"),
            ("Research under the supervision of Dr. Wei Chen in Shanghai.", "Wei Chen"),
            ("The project is led by Assoc. Prof. Maria J. Lopez and collaborators.", "Maria J. Lopez"),
            ("You will work in Dr. Rahul Mehta's lab at HMS.", "Rahul Mehta"),
            ("For questions contact Dr. Ola Nordmann at ola@example.no", "Ola Nordmann"),
            ("The Sofia Rossi Lab studies gut microbes.", "Sofia Rossi"),
            ("Group leader: Łukasz Nowak", "Łukasz Nowak"),
        ];
        let extractor = extractor();
        for (text, expected) in cases {
            assert_eq!(extractor.extract(text).as_deref(), Some(expected), "text: {text}");
        }
    }

    #[test]
    fn field_names_are_not_people() {
        let extractor = extractor();
        assert_eq!(extractor.extract("Join the Synthetic Biology Group at our institute."), None);
        assert_eq!(extractor.extract("Machine Learning Lab, remote friendly."), None);
        assert_eq!(extractor.extract(""), None);
    }

    #[test]
    fn name_validator_rules() {
        assert!(is_valid_name("Jane Smith"));
        assert!(!is_valid_name("Smith"));
        assert!(!is_valid_name("the Smith"));
        assert!(!is_valid_name("Systems Biology"));
        assert!(!is_valid_name("New York"));
        assert!(!is_valid_name("Anna and Bob"));
    }

    #[test]
    fn custom_matchers_run_in_given_order() {
        struct Fixed(&'static str);
        impl NameMatcher for Fixed {
            fn label(&self) -> &'static str {
                "fixed"
            }
            fn find(&self, _text: &str) -> Option<String> {
                Some(self.0.to_string())
            }
        }

        let extractor = PiNameExtractor::with_matchers(vec![Box::new(Fixed("First Choice")), Box::new(Fixed("Second Choice"))]);
        assert_eq!(extractor.extract("anything").as_deref(), Some("First Choice"));
        assert_eq!(extractor.matcher_labels(), vec!["fixed", "fixed"]);
    }
}

//! Ordered, first-match-wins category rules over name, formula and synonyms.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chemfill_core::{CanonicalRecord, FieldName};
use serde::{Deserialize, Serialize};

pub const UNCATEGORIZED: &str = "Uncategorized";

/// Highest rule file `version` this build understands.
pub const RULES_VERSION: u32 = 1;

const HALOGENS: [&str; 5] = ["F", "Cl", "Br", "I", "At"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Case-insensitive substring match against the name and synonyms.
    NameContainsAny { tokens: Vec<String> },
    FormulaHasElement { elements: Vec<String> },
    /// Formula contains carbon and nothing outside `elements`.
    FormulaOnlyElements { elements: Vec<String> },
    /// Degree of unsaturation (rings plus pi bonds) of at least `value`.
    FormulaUnsaturationAtLeast {
        value: f64,
        #[serde(default)]
        min_carbons: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub label: String,
    pub any_of: Vec<Predicate>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    rules: Vec<Rule>,
}

/// What the rules look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierInput<'a> {
    pub name: Option<&'a str>,
    pub formula: Option<&'a str>,
    pub synonyms: Option<&'a str>,
}

impl<'a> ClassifierInput<'a> {
    pub fn from_record(record: &'a CanonicalRecord) -> Self {
        Self {
            name: record
                .value(FieldName::ChemicalName)
                .or(record.hint_name.as_deref()),
            formula: record.value(FieldName::MolecularFormula),
            synonyms: record.value(FieldName::Synonyms),
        }
    }
}

struct Facts {
    text: String,
    elements: Option<BTreeMap<String, u32>>,
}

impl Facts {
    fn gather(input: &ClassifierInput<'_>) -> Self {
        let text = [input.name, input.synonyms]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self {
            text,
            elements: input.formula.and_then(parse_formula),
        }
    }

    fn count(&self, element: &str) -> u32 {
        self.elements
            .as_ref()
            .and_then(|e| e.get(element))
            .copied()
            .unwrap_or(0)
    }
}

impl Predicate {
    fn matches(&self, facts: &Facts) -> bool {
        match self {
            Predicate::NameContainsAny { tokens } => tokens
                .iter()
                .any(|token| !token.is_empty() && facts.text.contains(&token.to_lowercase())),
            Predicate::FormulaHasElement { elements } => elements.iter().any(|e| facts.count(e) > 0),
            Predicate::FormulaOnlyElements { elements } => facts.elements.as_ref().is_some_and(|counts| {
                counts.contains_key("C") && counts.keys().all(|e| elements.iter().any(|allowed| allowed == e))
            }),
            Predicate::FormulaUnsaturationAtLeast { value, min_carbons } => {
                facts.count("C") >= (*min_carbons).max(1)
                    && unsaturation(facts).is_some_and(|u| u >= *value)
            }
        }
    }
}

fn unsaturation(facts: &Facts) -> Option<f64> {
    facts.elements.as_ref()?;
    let c = f64::from(facts.count("C") + facts.count("Si"));
    let h = f64::from(facts.count("H"));
    let x: f64 = HALOGENS.iter().map(|e| f64::from(facts.count(e))).sum();
    let n = f64::from(facts.count("N") + facts.count("P"));
    Some(c + 1.0 + n / 2.0 - (h + x) / 2.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(text).context("parsing classification rules")?;
        if let Some(version) = file.version.filter(|v| *v > RULES_VERSION) {
            bail!("classification rule file version {version} is newer than supported version {RULES_VERSION}");
        }
        if file.rules.is_empty() {
            bail!("classification rule file defines no rules");
        }
        if let Some(rule) = file
            .rules
            .iter()
            .find(|r| r.label.trim().is_empty() || r.any_of.is_empty())
        {
            bail!("classification rule {:?} needs a label and at least one predicate", rule.label);
        }
        Ok(Self::new(file.rules))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Label of the first matching rule, or [`UNCATEGORIZED`].
    pub fn classify(&self, input: &ClassifierInput<'_>) -> &str {
        let facts = Facts::gather(input);
        self.rules
            .iter()
            .find(|rule| rule.any_of.iter().any(|p| p.matches(&facts)))
            .map_or(UNCATEGORIZED, |rule| rule.label.as_str())
    }

    pub fn classify_record(&self, record: &CanonicalRecord) -> String {
        self.classify(&ClassifierInput::from_record(record)).to_string()
    }

    pub fn builtin() -> Self {
        fn tokens(list: &[&str]) -> Predicate {
            Predicate::NameContainsAny {
                tokens: list.iter().map(|t| t.to_string()).collect(),
            }
        }
        fn has(list: &[&str]) -> Predicate {
            Predicate::FormulaHasElement {
                elements: list.iter().map(|t| t.to_string()).collect(),
            }
        }
        fn rule(label: &str, any_of: Vec<Predicate>) -> Rule {
            Rule {
                label: label.to_string(),
                any_of,
            }
        }

        Self::new(vec![
            rule(
                "Steroidal",
                vec![tokens(&["steroid", "estradiol", "testosterone", "corticosteroid", "cholest"])],
            ),
            rule(
                "Heterocyclic",
                vec![tokens(&[
                    "triazole", "pyrazole", "imidazole", "thiazole", "oxazole", "pyridine", "quinoline",
                    "isoquinoline", "indole", "pyrimidine", "piperidine", "piperazine", "morpholine",
                    "azetidine",
                ])],
            ),
            rule(
                "Halogenated",
                vec![
                    has(&HALOGENS),
                    tokens(&["chloro", "fluoro", "bromo", "iodo", "halide"]),
                ],
            ),
            rule(
                "Phosphorus-Containing",
                vec![has(&["P"]), tokens(&["phosphate", "phosphonate", "phosphine"])],
            ),
            rule(
                "Sulfur-Containing",
                vec![has(&["S"]), tokens(&["thiol", "thio", "sulfonamide", "sulfide"])],
            ),
            rule(
                "Nitrogen-Containing",
                vec![
                    has(&["N"]),
                    tokens(&["amine", "amino", "urea", "azide", "azo", "nitrile", "hydrazine"]),
                ],
            ),
            rule(
                "Aromatic",
                vec![
                    Predicate::FormulaUnsaturationAtLeast {
                        value: 4.0,
                        min_carbons: 6,
                    },
                    tokens(&["benzene", "phenyl", "toluene", "naphthalene", "aromatic"]),
                ],
            ),
            rule(
                "Aliphatic",
                vec![
                    Predicate::FormulaOnlyElements {
                        elements: vec!["C".into(), "H".into(), "O".into()],
                    },
                    tokens(&["methyl", "ethyl", "propyl", "butyl", "pentyl", "hexyl", "cycloalkyl"]),
                ],
            ),
            rule(
                "Oxygen-Containing",
                vec![
                    has(&["O"]),
                    tokens(&["alcohol", "ether", "aldehyde", "ketone", "acid", "ester", "anhydride"]),
                ],
            ),
        ])
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Element counts of a molecular formula such as `C6H5Cl`, `Ca(OH)2` or
/// `CuSO4·5H2O`. `None` for anything that does not parse.
pub fn parse_formula(formula: &str) -> Option<BTreeMap<String, u32>> {
    let mut total = BTreeMap::new();
    for part in formula.split(['.', '·', '•', '*']) {
        let part: String = part.chars().filter(|c| !c.is_whitespace()).collect();
        if part.is_empty() {
            return None;
        }
        let digits = part.chars().take_while(char::is_ascii_digit).count();
        let multiplier: u32 = if digits == 0 { 1 } else { part[..digits].parse().ok()? };
        for (element, count) in parse_group(&part[digits..])? {
            let slot = total.entry(element).or_insert(0u32);
            *slot = slot.saturating_add(count.saturating_mul(multiplier));
        }
    }
    if total.is_empty() {
        None
    } else {
        Some(total)
    }
}

fn parse_group(text: &str) -> Option<BTreeMap<String, u32>> {
    let chars: Vec<char> = text.chars().collect();
    let mut stack: Vec<BTreeMap<String, u32>> = vec![BTreeMap::new()];
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '(' | '[' => {
                stack.push(BTreeMap::new());
                i += 1;
            }
            ')' | ']' => {
                let (count, next) = read_count(&chars, i + 1)?;
                i = next;
                let group = stack.pop()?;
                let parent = stack.last_mut()?;
                for (element, n) in group {
                    let slot = parent.entry(element).or_insert(0);
                    *slot = slot.saturating_add(n.saturating_mul(count));
                }
            }
            c if c.is_ascii_uppercase() => {
                let mut symbol = c.to_string();
                i += 1;
                while i < chars.len() && chars[i].is_ascii_lowercase() {
                    symbol.push(chars[i]);
                    i += 1;
                }
                if symbol.len() > 3 {
                    return None;
                }
                let (count, next) = read_count(&chars, i)?;
                i = next;
                let slot = stack.last_mut()?.entry(symbol).or_insert(0);
                *slot = slot.saturating_add(count);
            }
            _ => return None,
        }
    }
    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}

fn read_count(chars: &[char], start: usize) -> Option<(u32, usize)> {
    let end = chars[start..]
        .iter()
        .position(|c| !c.is_ascii_digit())
        .map_or(chars.len(), |offset| start + offset);
    if end == start {
        return Some((1, start));
    }
    let digits: String = chars[start..end].iter().collect();
    Some((digits.parse().ok()?, end))
}

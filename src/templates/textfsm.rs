//! A TextFSM subset: enough of the template language to drive the vendor
//! templates shipped with netsnap.
//!
//! Supported: `Value [Filldown,Required,Key] NAME (regex)` declarations, named
//! states beginning at `Start`, rules of the form
//! `^regex -> [Next|Continue|Error][.Record|.NoRecord|.Clear|.Clearall] [State]`,
//! `${NAME}` substitution, `$$` as a literal `$`, the `End` state and an
//! implicit record at end of input (suppressed by declaring an `EOF` state).

use regex::Regex;
use std::collections::HashMap;

use super::Record;

#[derive(Debug)]
pub struct TextFsm {
    values: Vec<ValueDef>,
    states: HashMap<String, Vec<Rule>>,
    record_at_eof: bool,
}

#[derive(Debug)]
struct ValueDef {
    name: String,
    pattern: String,
    filldown: bool,
    required: bool,
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    line_op: LineOp,
    record_op: RecordOp,
    next_state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineOp {
    Next,
    Continue,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOp {
    NoRecord,
    Record,
    Clear,
    Clearall,
}

/// Compile failure, carrying the 1-based template line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: usize,
    pub reason: String,
}

/// An `Error` rule fired on the given 1-based input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    pub line: usize,
    pub text: String,
}

const START: &str = "Start";
const END: &str = "End";
const EOF: &str = "EOF";

impl TextFsm {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let mut lines = source.lines().enumerate().map(|(i, l)| (i + 1, l));
        let mut values: Vec<ValueDef> = Vec::new();

        for (line_no, line) in lines.by_ref() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                continue;
            }
            if trimmed.is_empty() {
                if values.is_empty() {
                    continue;
                }
                break;
            }
            let rest = trimmed.strip_prefix("Value ").ok_or_else(|| CompileError {
                line: line_no,
                reason: format!("expected a Value declaration, found '{trimmed}'"),
            })?;
            let value = parse_value(rest).map_err(|reason| CompileError {
                line: line_no,
                reason,
            })?;
            if values.iter().any(|v| v.name == value.name) {
                return Err(CompileError {
                    line: line_no,
                    reason: format!("duplicate value '{}'", value.name),
                });
            }
            values.push(value);
        }

        let mut states: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut current: Option<String> = None;
        let mut referenced: Vec<(usize, String)> = Vec::new();

        for (line_no, line) in lines {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                continue;
            }
            if trimmed.is_empty() {
                current = None;
                continue;
            }
            if !line.starts_with(char::is_whitespace) {
                if states.contains_key(trimmed) {
                    return Err(CompileError {
                        line: line_no,
                        reason: format!("duplicate state '{trimmed}'"),
                    });
                }
                states.insert(trimmed.to_string(), Vec::new());
                current = Some(trimmed.to_string());
                continue;
            }

            let state = current.as_ref().ok_or_else(|| CompileError {
                line: line_no,
                reason: "rule outside of a state".to_string(),
            })?;
            let rule = parse_rule(trimmed, &values).map_err(|reason| CompileError {
                line: line_no,
                reason,
            })?;
            if let Some(next) = &rule.next_state {
                referenced.push((line_no, next.clone()));
            }
            if let Some(rules) = states.get_mut(state) {
                rules.push(rule);
            }
        }

        if !states.contains_key(START) {
            return Err(CompileError {
                line: 0,
                reason: "template has no Start state".to_string(),
            });
        }
        for (line_no, name) in referenced {
            if name != END && name != EOF && !states.contains_key(&name) {
                return Err(CompileError {
                    line: line_no,
                    reason: format!("rule targets unknown state '{name}'"),
                });
            }
        }

        let record_at_eof = !states.contains_key(EOF);
        Ok(Self {
            values,
            states,
            record_at_eof,
        })
    }

    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|v| v.name.as_str())
    }

    pub fn parse(&self, text: &str) -> Result<Vec<Record>, RunError> {
        let mut current: Vec<Option<String>> = vec![None; self.values.len()];
        let mut records = Vec::new();
        let mut state = START.to_string();

        'lines: for (idx, line) in text.lines().enumerate() {
            let Some(rules) = self.states.get(&state) else {
                break;
            };
            for rule in rules {
                let Some(caps) = rule.regex.captures(line) else {
                    continue;
                };
                for (slot, value) in current.iter_mut().zip(&self.values) {
                    if let Some(m) = caps.name(&value.name) {
                        *slot = Some(m.as_str().to_string());
                    }
                }

                if rule.line_op == LineOp::Error {
                    return Err(RunError {
                        line: idx + 1,
                        text: line.to_string(),
                    });
                }

                match rule.record_op {
                    RecordOp::NoRecord => {}
                    RecordOp::Record => self.record(&mut current, &mut records),
                    RecordOp::Clear => self.clear(&mut current, false),
                    RecordOp::Clearall => self.clear(&mut current, true),
                }

                if let Some(next) = &rule.next_state {
                    if next == END {
                        return Ok(records);
                    }
                    state = next.clone();
                }

                if rule.line_op == LineOp::Next {
                    continue 'lines;
                }
            }
        }

        if self.record_at_eof {
            self.record(&mut current, &mut records);
        }
        Ok(records)
    }

    fn record(&self, current: &mut [Option<String>], records: &mut Vec<Record>) {
        let has_data = current
            .iter()
            .zip(&self.values)
            .any(|(slot, value)| !value.filldown && slot.as_deref().is_some_and(|s| !s.is_empty()));
        let required_met = current
            .iter()
            .zip(&self.values)
            .all(|(slot, value)| !value.required || slot.as_deref().is_some_and(|s| !s.is_empty()));

        if has_data && required_met {
            let record = self
                .values
                .iter()
                .zip(current.iter())
                .map(|(value, slot)| (value.name.clone(), slot.clone().unwrap_or_default()))
                .collect();
            records.push(record);
        }
        self.clear(current, false);
    }

    fn clear(&self, current: &mut [Option<String>], all: bool) {
        for (slot, value) in current.iter_mut().zip(&self.values) {
            if all || !value.filldown {
                *slot = None;
            }
        }
    }
}

fn parse_value(rest: &str) -> Result<ValueDef, String> {
    let open = rest
        .find('(')
        .ok_or_else(|| "value regex must be enclosed in parentheses".to_string())?;
    let pattern = rest[open..].trim();
    if !pattern.ends_with(')') {
        return Err("value regex must be enclosed in parentheses".to_string());
    }

    let head: Vec<&str> = rest[..open].split_whitespace().collect();
    let (options, name) = match head.as_slice() {
        [name] => ("", *name),
        [options, name] => (*options, *name),
        _ => return Err(format!("malformed value declaration '{rest}'")),
    };
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid value name '{name}'"));
    }

    let mut value = ValueDef {
        name: name.to_string(),
        pattern: pattern.to_string(),
        filldown: false,
        required: false,
    };
    for option in options.split(',').filter(|o| !o.is_empty()) {
        match option {
            "Filldown" => value.filldown = true,
            "Required" => value.required = true,
            "Key" => {}
            other => return Err(format!("unsupported value option '{other}'")),
        }
    }
    Ok(value)
}

fn parse_rule(text: &str, values: &[ValueDef]) -> Result<Rule, String> {
    if !text.starts_with('^') {
        return Err(format!("rule must start with '^', found '{text}'"));
    }
    let (pattern, action) = match text.rfind(" -> ") {
        Some(pos) => (text[..pos].trim_end(), text[pos + 4..].trim()),
        None => (text, ""),
    };

    let expanded = expand_pattern(pattern, values)?;
    let regex = Regex::new(&expanded).map_err(|err| format!("invalid rule regex: {err}"))?;

    let mut line_op = LineOp::Next;
    let mut record_op = RecordOp::NoRecord;
    let mut next_state = None;
    let mut tokens = action.split_whitespace();

    if let Some(first) = tokens.next() {
        let is_action = match first.split_once('.') {
            Some((line, record)) => {
                line_op = parse_line_op(line).ok_or_else(|| format!("unknown line action '{line}'"))?;
                record_op =
                    parse_record_op(record).ok_or_else(|| format!("unknown record action '{record}'"))?;
                true
            }
            None => {
                if let Some(op) = parse_line_op(first) {
                    line_op = op;
                    true
                } else if let Some(op) = parse_record_op(first) {
                    record_op = op;
                    true
                } else {
                    next_state = Some(first.to_string());
                    false
                }
            }
        };
        // Anything after `Error` is a message, not a state.
        if is_action && line_op != LineOp::Error {
            next_state = tokens.next().map(str::to_string);
        }
    }

    if line_op == LineOp::Continue && next_state.is_some() {
        return Err("Continue cannot be combined with a state change".to_string());
    }

    Ok(Rule {
        regex,
        line_op,
        record_op,
        next_state,
    })
}

fn parse_line_op(token: &str) -> Option<LineOp> {
    match token {
        "Next" => Some(LineOp::Next),
        "Continue" => Some(LineOp::Continue),
        "Error" => Some(LineOp::Error),
        _ => None,
    }
}

fn parse_record_op(token: &str) -> Option<RecordOp> {
    match token {
        "NoRecord" => Some(RecordOp::NoRecord),
        "Record" => Some(RecordOp::Record),
        "Clear" => Some(RecordOp::Clear),
        "Clearall" => Some(RecordOp::Clearall),
        _ => None,
    }
}

fn expand_pattern(pattern: &str, values: &[ValueDef]) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("$$") {
            out.push('$');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            let end = after
                .find('}')
                .ok_or_else(|| "unterminated ${...} reference".to_string())?;
            let name = &after[..end];
            let value = values
                .iter()
                .find(|v| v.name == name)
                .ok_or_else(|| format!("reference to undeclared value '{name}'"))?;
            out.push_str(&format!("(?P<{}>{})", value.name, value.pattern));
            rest = &after[end + 1..];
        } else {
            out.push('$');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERFACES: &str = r"Value Required NAME (\S+)
Value STATE (up|down)
Value MTU (\d+)

Start
  ^Interface: -> Continue.Record
  ^Interface:\s+${NAME}
  ^\s+Oper state\s+:\s+${STATE}
  ^\s+MTU\s+:\s+${MTU}
";

    #[test]
    fn records_on_each_new_block_and_at_eof() {
        let fsm = TextFsm::compile(INTERFACES).unwrap();
        let output = "Interface: ethernet-1/1\n  Oper state : up\n  MTU : 9232\n\
                      Interface: mgmt0\n  Oper state : down\n";
        let records = fsm.parse(output).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["NAME"], "ethernet-1/1");
        assert_eq!(records[0]["STATE"], "up");
        assert_eq!(records[0]["MTU"], "9232");
        assert_eq!(records[1]["NAME"], "mgmt0");
        assert_eq!(records[1]["MTU"], "");
    }

    #[test]
    fn required_value_drops_incomplete_records() {
        let fsm = TextFsm::compile(INTERFACES).unwrap();
        let records = fsm.parse("  Oper state : up\n").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn filldown_carries_into_following_records() {
        let template = r"Value Filldown HOST (\S+)
Value PORT (\S+)

Start
  ^host ${HOST}
  ^port ${PORT} -> Record
";
        let fsm = TextFsm::compile(template).unwrap();
        let records = fsm.parse("host r1\nport a\nport b\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["HOST"], "r1");
        assert_eq!(records[1]["PORT"], "b");
    }

    #[test]
    fn state_transitions_and_end() {
        let template = r"Value ITEM (\w+)

Start
  ^begin -> Body

Body
  ^item ${ITEM} -> Record
  ^stop -> End
";
        let fsm = TextFsm::compile(template).unwrap();
        let records = fsm
            .parse("item ignored\nbegin\nitem one\nitem two\nstop\nitem three\n")
            .unwrap();
        let items: Vec<&str> = records.iter().map(|r| r["ITEM"].as_str()).collect();
        assert_eq!(items, vec!["one", "two"]);
    }

    #[test]
    fn error_rule_aborts_parse() {
        let template = "Value X (\\d+)\n\nStart\n  ^x ${X}\n  ^% Invalid -> Error\n";
        let fsm = TextFsm::compile(template).unwrap();
        let err = fsm.parse("x 1\n% Invalid input\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn double_dollar_is_literal_anchor() {
        let template = "Value X (\\d+)\n\nStart\n  ^x ${X}$$ -> Record\n";
        let fsm = TextFsm::compile(template).unwrap();
        let records = fsm.parse("x 12\nx 13 trailing\n").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["X"], "12");
    }

    #[test]
    fn compile_rejects_broken_templates() {
        assert!(TextFsm::compile("Value X (\\d+)\n\nBody\n  ^x ${X}\n").is_err());
        assert!(TextFsm::compile("Value X (\\d+)\n\nStart\n  ^x ${Y}\n").is_err());
        assert!(TextFsm::compile("Value X (\\d+)\n\nStart\n  ^x -> Missing\n").is_err());
        assert!(TextFsm::compile("Value Bogus X (\\d+)\n\nStart\n  ^x\n").is_err());
    }
}

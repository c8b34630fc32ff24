//! Chart template engine
//!
//! Supports the subset of Go-template syntax that charts in practice rely on:
//! - value lookups: `{{ .Values.image.tag }}`, `{{ .Release.Name }}`,
//!   `{{ .Release.Namespace }}`, `{{ .Chart.Name }}`, `{{ .Chart.Version }}`
//! - pipes into `default`, `quote`, `upper`, `lower`
//! - `required "message" .Values.x`
//! - `if` / `else` / `end` blocks
//! - comments `{{/* ... */}}` and whitespace trimming with `{{-` / `-}}`
//!
//! Anything else is a syntax error.

use serde_json::Value;

use crate::error::RenderError;

const FUNCTIONS: &[&str] = &["default", "quote", "upper", "lower", "required"];
const ROOT_OBJECTS: &[&str] = &["Values", "Release", "Chart"];

/// A parsed template, ready to render against a context.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    file: String,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output { pipeline: Pipeline, line: usize },
    If {
        condition: Pipeline,
        line: usize,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Value(Term),
    Call { function: String, args: Vec<Term> },
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Field(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Number(Value),
    Pipe,
}

/// Raw pieces of a template before block structure is resolved.
#[derive(Debug)]
enum Piece {
    Text(String),
    Action {
        body: String,
        line: usize,
        trim_left: bool,
        trim_right: bool,
    },
}

impl Template {
    pub fn parse(file: &str, source: &str) -> Result<Self, RenderError> {
        let pieces = split_pieces(file, source)?;
        let pieces = apply_trimming(pieces);

        let mut stack: Vec<Frame> = vec![Frame::root()];
        for piece in pieces {
            match piece {
                Piece::Text(text) => {
                    if !text.is_empty() {
                        current(&mut stack).push(Node::Text(text));
                    }
                }
                Piece::Action { body, line, .. } => {
                    let body = body.trim();
                    if body.starts_with("/*") {
                        if !body.ends_with("*/") {
                            return Err(syntax(file, line, "unterminated comment"));
                        }
                        continue;
                    }

                    let (keyword, rest) = match body.split_once(char::is_whitespace) {
                        Some((k, r)) => (k, r.trim()),
                        None => (body, ""),
                    };
                    match keyword {
                        "if" => {
                            let condition = parse_pipeline(file, line, rest)?;
                            stack.push(Frame {
                                condition: Some((condition, line)),
                                then: Vec::new(),
                                otherwise: Vec::new(),
                                in_else: false,
                            });
                        }
                        "else" => {
                            if !rest.is_empty() {
                                return Err(syntax(file, line, "`else if` is not supported"));
                            }
                            let frame = stack
                                .last_mut()
                                .filter(|f| f.condition.is_some() && !f.in_else)
                                .ok_or_else(|| syntax(file, line, "`else` without `if`"))?;
                            frame.in_else = true;
                        }
                        "end" => {
                            if stack.len() < 2 {
                                return Err(syntax(file, line, "`end` without `if`"));
                            }
                            let frame = stack.pop().ok_or_else(|| syntax(file, line, "`end` without `if`"))?;
                            let (condition, if_line) = frame
                                .condition
                                .ok_or_else(|| syntax(file, line, "`end` without `if`"))?;
                            current(&mut stack).push(Node::If {
                                condition,
                                line: if_line,
                                then: frame.then,
                                otherwise: frame.otherwise,
                            });
                        }
                        "range" | "with" | "define" | "template" | "include" | "block" => {
                            return Err(syntax(
                                file,
                                line,
                                &format!("`{}` is not supported", keyword),
                            ));
                        }
                        _ => {
                            let pipeline = parse_pipeline(file, line, body)?;
                            current(&mut stack).push(Node::Output { pipeline, line });
                        }
                    }
                }
            }
        }

        if stack.len() > 1 {
            let line = stack
                .last()
                .and_then(|f| f.condition.as_ref().map(|(_, l)| *l))
                .unwrap_or(0);
            return Err(syntax(file, line, "`if` without matching `end`"));
        }

        let nodes = stack.pop().map(|f| f.then).unwrap_or_default();
        Ok(Self {
            file: file.to_string(),
            nodes,
        })
    }

    /// Render against a context object with `Values`, `Release` and `Chart` keys.
    pub fn render(&self, context: &Value) -> Result<String, RenderError> {
        let mut out = String::new();
        render_nodes(&self.file, &self.nodes, context, &mut out)?;
        Ok(out)
    }
}

struct Frame {
    condition: Option<(Pipeline, usize)>,
    then: Vec<Node>,
    otherwise: Vec<Node>,
    in_else: bool,
}

impl Frame {
    fn root() -> Self {
        Self {
            condition: None,
            then: Vec::new(),
            otherwise: Vec::new(),
            in_else: false,
        }
    }
}

fn current(stack: &mut [Frame]) -> &mut Vec<Node> {
    let len = stack.len();
    let frame = &mut stack[len - 1];
    if frame.in_else {
        &mut frame.otherwise
    } else {
        &mut frame.then
    }
}

fn syntax(file: &str, line: usize, message: &str) -> RenderError {
    RenderError::Syntax {
        file: file.to_string(),
        message: format!("line {}: {}", line, message),
    }
}

fn split_pieces(file: &str, source: &str) -> Result<Vec<Piece>, RenderError> {
    let mut pieces = Vec::new();
    let mut rest = source;
    let mut line = 1;

    while let Some(start) = rest.find("{{") {
        let text = &rest[..start];
        line += text.matches('\n').count();
        pieces.push(Piece::Text(text.to_string()));

        let after_open = &rest[start + 2..];
        let end = find_action_end(after_open)
            .ok_or_else(|| syntax(file, line, "unclosed action"))?;
        let mut body = &after_open[..end];

        let trim_left = body.starts_with('-') && body[1..].starts_with(char::is_whitespace);
        if trim_left {
            body = &body[1..];
        }
        let trim_right = body.ends_with('-') && body[..body.len() - 1].ends_with(char::is_whitespace);
        if trim_right {
            body = &body[..body.len() - 1];
        }

        pieces.push(Piece::Action {
            body: body.to_string(),
            line,
            trim_left,
            trim_right,
        });
        line += body.matches('\n').count();
        rest = &after_open[end + 2..];
    }
    pieces.push(Piece::Text(rest.to_string()));
    Ok(pieces)
}

/// Position of the closing `}}`, skipping over string literals.
fn find_action_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn apply_trimming(mut pieces: Vec<Piece>) -> Vec<Piece> {
    for i in 0..pieces.len() {
        let (trim_left, trim_right) = match &pieces[i] {
            Piece::Action {
                trim_left,
                trim_right,
                ..
            } => (*trim_left, *trim_right),
            Piece::Text(_) => continue,
        };
        if trim_left && i > 0 {
            if let Piece::Text(text) = &mut pieces[i - 1] {
                let trimmed = text.trim_end().len();
                text.truncate(trimmed);
            }
        }
        if trim_right && i + 1 < pieces.len() {
            if let Piece::Text(text) = &mut pieces[i + 1] {
                *text = text.trim_start().to_string();
            }
        }
    }
    pieces
}

fn tokenize(file: &str, line: usize, body: &str) -> Result<Vec<Token>, RenderError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '|' {
            tokens.push(Token::Pipe);
            i += 1;
        } else if c == '"' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(syntax(file, line, "unterminated string")),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('"') => value.push('"'),
                            Some('\\') => value.push('\\'),
                            _ => return Err(syntax(file, line, "invalid escape in string")),
                        }
                        i += 2;
                    }
                    Some(other) => {
                        value.push(*other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
        } else if c == '.' {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let raw: String = chars[start + 1..i].iter().collect();
            let path: Vec<String> = if raw.is_empty() {
                Vec::new()
            } else {
                raw.split('.').map(|s| s.to_string()).collect()
            };
            if path.iter().any(|s| s.is_empty()) {
                return Err(syntax(file, line, &format!("invalid field .{}", raw)));
            }
            tokens.push(Token::Field(path));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            let number = if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else {
                raw.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| syntax(file, line, &format!("invalid number {}", raw)))?
            };
            tokens.push(Token::Number(number));
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            return Err(syntax(file, line, &format!("unexpected character '{}'", c)));
        }
    }
    Ok(tokens)
}

fn parse_pipeline(file: &str, line: usize, body: &str) -> Result<Pipeline, RenderError> {
    let tokens = tokenize(file, line, body)?;
    if tokens.is_empty() {
        return Err(syntax(file, line, "empty action"));
    }

    let mut commands = Vec::new();
    for segment in tokens.split(|t| *t == Token::Pipe) {
        commands.push(parse_command(file, line, segment, !commands.is_empty())?);
    }

    if commands.iter().skip(1).any(|c| matches!(c, Command::Value(_))) {
        return Err(syntax(file, line, "only functions can follow a pipe"));
    }
    Ok(Pipeline { commands })
}

fn parse_command(file: &str, line: usize, tokens: &[Token], piped: bool) -> Result<Command, RenderError> {
    let Some((first, rest)) = tokens.split_first() else {
        return Err(syntax(file, line, "empty pipeline stage"));
    };

    let mut args = Vec::new();
    for token in rest {
        args.push(term(file, line, token)?);
    }

    match first {
        Token::Ident(name) => {
            match name.as_str() {
                "true" | "false" | "nil" if rest.is_empty() && !piped => {
                    return Ok(Command::Value(term(file, line, first)?));
                }
                _ => {}
            }
            if !FUNCTIONS.contains(&name.as_str()) {
                return Err(syntax(file, line, &format!("unknown function {}", name)));
            }
            let expected = match name.as_str() {
                "default" | "required" => 2,
                _ => 1,
            };
            let supplied = args.len() + usize::from(piped);
            if supplied != expected {
                return Err(syntax(
                    file,
                    line,
                    &format!("{} expects {} argument(s), got {}", name, expected, supplied),
                ));
            }
            Ok(Command::Call {
                function: name.clone(),
                args,
            })
        }
        _ if rest.is_empty() => Ok(Command::Value(term(file, line, first)?)),
        _ => Err(syntax(file, line, "unexpected arguments after value")),
    }
}

fn term(file: &str, line: usize, token: &Token) -> Result<Term, RenderError> {
    match token {
        Token::Field(path) => {
            if let Some(root) = path.first() {
                if !ROOT_OBJECTS.contains(&root.as_str()) {
                    return Err(syntax(file, line, &format!("unknown object .{}", root)));
                }
            }
            Ok(Term::Field(path.clone()))
        }
        Token::Str(s) => Ok(Term::Literal(Value::String(s.clone()))),
        Token::Number(n) => Ok(Term::Literal(n.clone())),
        Token::Ident(word) => match word.as_str() {
            "true" => Ok(Term::Literal(Value::Bool(true))),
            "false" => Ok(Term::Literal(Value::Bool(false))),
            "nil" => Ok(Term::Literal(Value::Null)),
            other => Err(syntax(file, line, &format!("unexpected identifier {}", other))),
        },
        Token::Pipe => Err(syntax(file, line, "unexpected |")),
    }
}

fn render_nodes(file: &str, nodes: &[Node], context: &Value, out: &mut String) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output { pipeline, line } => {
                let value = evaluate(file, *line, pipeline, context)?;
                out.push_str(&display(&value));
            }
            Node::If {
                condition,
                line,
                then,
                otherwise,
            } => {
                let value = evaluate(file, *line, condition, context)?;
                if is_truthy(&value) {
                    render_nodes(file, then, context, out)?;
                } else {
                    render_nodes(file, otherwise, context, out)?;
                }
            }
        }
    }
    Ok(())
}

fn lookup(context: &Value, path: &[String]) -> Value {
    let mut current = context;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn resolve(term: &Term, context: &Value) -> Value {
    match term {
        Term::Field(path) => lookup(context, path),
        Term::Literal(v) => v.clone(),
    }
}

fn evaluate(file: &str, line: usize, pipeline: &Pipeline, context: &Value) -> Result<Value, RenderError> {
    let mut piped: Option<Value> = None;
    for command in &pipeline.commands {
        let value = match command {
            Command::Value(term) => resolve(term, context),
            Command::Call { function, args } => {
                let mut values: Vec<Value> = args.iter().map(|a| resolve(a, context)).collect();
                if let Some(previous) = piped.take() {
                    values.push(previous);
                }
                call(file, line, function, values)?
            }
        };
        piped = Some(value);
    }
    Ok(piped.unwrap_or(Value::Null))
}

fn call(file: &str, line: usize, function: &str, mut args: Vec<Value>) -> Result<Value, RenderError> {
    let last = args.pop().unwrap_or(Value::Null);
    match function {
        "default" => {
            let fallback = args.pop().unwrap_or(Value::Null);
            Ok(if is_truthy(&last) { last } else { fallback })
        }
        "required" => {
            let message = args.pop().map(|m| display(&m)).unwrap_or_default();
            if last.is_null() || last.as_str() == Some("") {
                Err(RenderError::MissingValue {
                    file: file.to_string(),
                    message: format!("line {}: {}", line, message),
                })
            } else {
                Ok(last)
            }
        }
        "quote" => Ok(Value::String(format!("{:?}", display(&last)))),
        "upper" => Ok(Value::String(display(&last).to_uppercase())),
        "lower" => Ok(Value::String(display(&last).to_lowercase())),
        other => Err(syntax(file, line, &format!("unknown function {}", other))),
    }
}

/// Empty values are false: null, false, 0, "", empty arrays and maps.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "Values": {"image": {"repository": "nginx", "tag": "1.27"}, "replicas": 2, "debug": false},
            "Release": {"Name": "web", "Namespace": "shop"},
            "Chart": {"Name": "webapp", "Version": "0.3.0"}
        })
    }

    fn render(source: &str) -> Result<String, RenderError> {
        Template::parse("templates/test.yaml", source)?.render(&context())
    }

    #[test]
    fn test_value_substitution() {
        assert_eq!(
            render("image: {{ .Values.image.repository }}:{{ .Values.image.tag }}").unwrap(),
            "image: nginx:1.27"
        );
        assert_eq!(
            render("name: {{ .Release.Name }}-{{ .Chart.Name }}").unwrap(),
            "name: web-webapp"
        );
    }

    #[test]
    fn test_pipes() {
        assert_eq!(render(r#"{{ .Values.missing | default "x" }}"#).unwrap(), "x");
        assert_eq!(render("{{ .Values.image.tag | quote }}").unwrap(), "\"1.27\"");
        assert_eq!(render("{{ .Release.Name | upper }}").unwrap(), "WEB");
        assert_eq!(render(r#"{{ "ABC" | lower | quote }}"#).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_required() {
        let err = render(r#"{{ required "image.digest is required" .Values.image.digest }}"#)
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingValue { .. }));
        assert_eq!(
            render(r#"{{ required "tag" .Values.image.tag }}"#).unwrap(),
            "1.27"
        );
    }

    #[test]
    fn test_comments_and_trimming() {
        assert_eq!(
            render("a: 1\n{{- /* dropped */}}\nb: 2").unwrap(),
            "a: 1\nb: 2"
        );
        assert_eq!(render("x: {{- \" y\" }}").unwrap(), "x: y");
    }

    #[test]
    fn test_if_else() {
        let source = "{{- if .Values.debug }}debug{{ else }}quiet{{ end }}";
        assert_eq!(render(source).unwrap(), "quiet");
        assert_eq!(
            render("{{ if .Values.replicas }}replicas: {{ .Values.replicas }}{{ end }}").unwrap(),
            "replicas: 2"
        );
    }

    #[test]
    fn test_unknown_syntax_is_an_error() {
        assert!(matches!(
            render("{{ include \"x\" . }}"),
            Err(RenderError::Syntax { .. })
        ));
        assert!(matches!(render("{{ toYaml .Values }}"), Err(RenderError::Syntax { .. })));
        assert!(matches!(render("{{ .Values.x "), Err(RenderError::Syntax { .. })));
        assert!(matches!(render("{{ .Capabilities.KubeVersion }}"), Err(RenderError::Syntax { .. })));
        assert!(matches!(render("{{ if .Values.debug }}x"), Err(RenderError::Syntax { .. })));
    }
}

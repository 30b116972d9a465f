use std::collections::BTreeSet;

use crate::error::{EngineError, EngineResult};
use crate::schema::{CollectionSchema, FieldType};

/// Hard cap on filter tokens, bounding worst-case parse and eval complexity.
const MAX_FILTER_TOKENS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Leaf(String),
}

/// One comparison inside a leaf. A leaf holds a list of these, OR-ed together
/// (the `[a,b,c]` set form), except for not-equals which is AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    NumEquals(f64),
    NumNotEquals(f64),
    NumGreater { value: f64, inclusive: bool },
    NumLess { value: f64, inclusive: bool },
    NumRange { lo: f64, hi: f64 },
    StrContains(String),
    StrEquals(String),
    StrNotEquals(String),
    GeoRadius { lat: f64, lng: f64, radius_m: f64 },
    GeoPolygon(Vec<(f64, f64)>),
    Id(String),
}

/// A leaf predicate: field plus its comparison list.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterLeaf {
    pub field: String,
    pub predicates: Vec<Predicate>,
    /// `$other_collection(inner filter)`: the inner expression is compiled
    /// by the referenced collection at evaluation time.
    pub reference: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterOp {
    And,
    Or,
}

/// The compiled filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Operator {
        op: FilterOp,
        left: Box<FilterNode>,
        right: Box<FilterNode>,
    },
    Leaf(FilterLeaf),
}

impl FilterNode {
    /// Collections referenced via `$coll(...)` leaves anywhere in the tree.
    pub fn referenced_collections(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<String>) {
        match self {
            FilterNode::Operator { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            FilterNode::Leaf(leaf) => {
                if let Some((collection, _)) = &leaf.reference {
                    out.push(collection.clone());
                }
            }
        }
    }
}

// ==================== Tokenizer ====================

fn tokenize_filter(input: &str) -> EngineResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        match ch {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            _ => {
                // A leaf runs until `&&`, `||`, or an unbalanced `)` at depth
                // zero. Backticks quote separators; parens inside the leaf
                // (geo tuples, `$ref(...)`) nest.
                let mut leaf = String::new();
                let mut depth = 0usize;
                let mut quoted = false;
                while i < chars.len() {
                    let c = chars[i];
                    if c == '`' {
                        quoted = !quoted;
                        leaf.push(c);
                        i += 1;
                        continue;
                    }
                    if !quoted {
                        if c == '(' {
                            depth += 1;
                        } else if c == ')' {
                            if depth == 0 {
                                break;
                            }
                            depth -= 1;
                        } else if depth == 0
                            && ((c == '&' && chars.get(i + 1) == Some(&'&'))
                                || (c == '|' && chars.get(i + 1) == Some(&'|')))
                        {
                            break;
                        }
                    }
                    leaf.push(c);
                    i += 1;
                }
                if quoted {
                    return Err(EngineError::ClientError(
                        "Could not parse the filter: unterminated backtick.".into(),
                    ));
                }
                let leaf = leaf.trim().to_string();
                if !leaf.is_empty() {
                    tokens.push(Token::Leaf(leaf));
                }
            }
        }
        if tokens.len() > MAX_FILTER_TOKENS {
            return Err(EngineError::ClientError(
                "`filter_by` has too many operations.".into(),
            ));
        }
    }
    Ok(tokens)
}

// ==================== Parser ====================

/// Compile a filter expression against a schema. Parse failures are 400s,
/// unknown fields 404s, type-mismatched values 400s.
pub fn parse_filter(input: &str, schema: &CollectionSchema) -> EngineResult<FilterNode> {
    let tokens = tokenize_filter(input)?;
    if tokens.is_empty() {
        return Err(EngineError::ClientError(
            "Could not parse the filter query.".into(),
        ));
    }

    // Shunting-yard: `&&` and `||` share one precedence level, left-assoc.
    let mut output: Vec<Token> = Vec::new();
    let mut ops: Vec<Token> = Vec::new();
    for token in tokens {
        match token {
            Token::Leaf(_) => output.push(token),
            Token::And | Token::Or => {
                while matches!(ops.last(), Some(Token::And) | Some(Token::Or)) {
                    output.push(ops.pop().expect("operator on stack"));
                }
                ops.push(token);
            }
            Token::LParen => ops.push(token),
            Token::RParen => loop {
                match ops.pop() {
                    Some(Token::LParen) => break,
                    Some(op) => output.push(op),
                    None => {
                        return Err(EngineError::ClientError(
                            "Could not parse the filter: unbalanced parentheses.".into(),
                        ))
                    }
                }
            },
        }
    }
    while let Some(op) = ops.pop() {
        if op == Token::LParen {
            return Err(EngineError::ClientError(
                "Could not parse the filter: unbalanced parentheses.".into(),
            ));
        }
        output.push(op);
    }

    // Build the tree bottom-up from postfix.
    let mut stack: Vec<FilterNode> = Vec::new();
    for token in output {
        match token {
            Token::Leaf(text) => stack.push(FilterNode::Leaf(parse_leaf(&text, schema)?)),
            Token::And | Token::Or => {
                let right = stack.pop();
                let left = stack.pop();
                let (Some(left), Some(right)) = (left, right) else {
                    return Err(EngineError::ClientError(
                        "Could not parse the filter query.".into(),
                    ));
                };
                stack.push(FilterNode::Operator {
                    op: if token == Token::And {
                        FilterOp::And
                    } else {
                        FilterOp::Or
                    },
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
            _ => unreachable!("parens are consumed by shunting-yard"),
        }
    }
    if stack.len() != 1 {
        return Err(EngineError::ClientError(
            "Could not parse the filter query.".into(),
        ));
    }
    Ok(stack.pop().expect("single root"))
}

fn parse_leaf(text: &str, schema: &CollectionSchema) -> EngineResult<FilterLeaf> {
    // Reference leaf: `$other_collection(inner filter)`.
    if let Some(rest) = text.strip_prefix('$') {
        let open = rest.find('(').ok_or_else(|| {
            EngineError::ClientError(format!("Could not parse the reference filter `{}`.", text))
        })?;
        if !rest.ends_with(')') {
            return Err(EngineError::ClientError(format!(
                "Could not parse the reference filter `{}`.",
                text
            )));
        }
        let collection = rest[..open].to_string();
        let inner = rest[open + 1..rest.len() - 1].to_string();
        return Ok(FilterLeaf {
            field: collection.clone(),
            predicates: Vec::new(),
            reference: Some((collection, inner)),
        });
    }

    let colon = find_unquoted(text, ':').ok_or_else(|| {
        EngineError::ClientError(format!("Could not parse the filter `{}`.", text))
    })?;
    let field_name = text[..colon].trim();
    let value_expr = text[colon + 1..].trim();
    if value_expr.is_empty() {
        return Err(EngineError::ClientError(format!(
            "Could not parse the filter `{}`: missing value.",
            text
        )));
    }

    if field_name == "id" {
        return parse_id_leaf(value_expr);
    }

    let field = schema.resolve(field_name).ok_or_else(|| {
        EngineError::NotFound(format!(
            "Could not find a filter field named `{}` in the schema.",
            field_name
        ))
    })?;

    let predicates = match field.field_type {
        FieldType::Int32 | FieldType::Int64 | FieldType::Float => {
            parse_numeric_predicates(field_name, value_expr, false)?
        }
        FieldType::Bool => parse_numeric_predicates(field_name, value_expr, true)?,
        FieldType::String | FieldType::Auto | FieldType::Image => {
            parse_string_predicates(value_expr)
        }
        FieldType::Geopoint => parse_geo_predicates(field_name, value_expr)?,
        FieldType::Object => {
            return Err(EngineError::ClientError(format!(
                "Cannot filter on the object field `{}` directly.",
                field_name
            )))
        }
    };

    Ok(FilterLeaf {
        field: field_name.to_string(),
        predicates,
        reference: None,
    })
}

fn parse_id_leaf(value_expr: &str) -> EngineResult<FilterLeaf> {
    if value_expr.starts_with("!=") {
        return Err(EngineError::ClientError(
            "The `!=` operator is not supported on the `id` field.".into(),
        ));
    }
    let values = split_values(strip_brackets(value_expr));
    let predicates = values
        .into_iter()
        .map(|v| Predicate::Id(unquote(&v)))
        .collect();
    Ok(FilterLeaf {
        field: "id".to_string(),
        predicates,
        reference: None,
    })
}

fn parse_numeric_predicates(
    field: &str,
    value_expr: &str,
    is_bool: bool,
) -> EngineResult<Vec<Predicate>> {
    let parse_num = |raw: &str| -> EngineResult<f64> {
        let raw = raw.trim();
        if is_bool {
            return match raw {
                "true" => Ok(1.0),
                "false" => Ok(0.0),
                _ => Err(EngineError::ClientError(format!(
                    "Value of field `{}` must be `true` or `false`.",
                    field
                ))),
            };
        }
        raw.parse::<f64>().map_err(|_| {
            EngineError::ClientError(format!("Value of field `{}` must be numeric.", field))
        })
    };

    if let Some(rest) = value_expr.strip_prefix("!=") {
        return split_values(strip_brackets(rest.trim()))
            .into_iter()
            .map(|v| parse_num(&v).map(Predicate::NumNotEquals))
            .collect();
    }
    if let Some(rest) = value_expr.strip_prefix(">=") {
        return Ok(vec![Predicate::NumGreater {
            value: parse_num(rest)?,
            inclusive: true,
        }]);
    }
    if let Some(rest) = value_expr.strip_prefix('>') {
        return Ok(vec![Predicate::NumGreater {
            value: parse_num(rest)?,
            inclusive: false,
        }]);
    }
    if let Some(rest) = value_expr.strip_prefix("<=") {
        return Ok(vec![Predicate::NumLess {
            value: parse_num(rest)?,
            inclusive: true,
        }]);
    }
    if let Some(rest) = value_expr.strip_prefix('<') {
        return Ok(vec![Predicate::NumLess {
            value: parse_num(rest)?,
            inclusive: false,
        }]);
    }
    let rest = value_expr.strip_prefix('=').unwrap_or(value_expr).trim();

    if rest.starts_with('[') && rest.ends_with(']') {
        let inner = &rest[1..rest.len() - 1];
        // `[a..b]` is an inclusive range; `[a, b, c]` an OR set.
        if let Some(dots) = inner.find("..") {
            let lo = parse_num(&inner[..dots])?;
            let hi = parse_num(&inner[dots + 2..])?;
            return Ok(vec![Predicate::NumRange { lo, hi }]);
        }
        return split_values(inner)
            .into_iter()
            .map(|v| parse_num(&v).map(Predicate::NumEquals))
            .collect();
    }
    Ok(vec![Predicate::NumEquals(parse_num(rest)?)])
}

fn parse_string_predicates(value_expr: &str) -> Vec<Predicate> {
    if let Some(rest) = value_expr.strip_prefix("!=") {
        return split_values(strip_brackets(rest.trim()))
            .into_iter()
            .map(|v| Predicate::StrNotEquals(unquote(&v)))
            .collect();
    }
    if let Some(rest) = value_expr.strip_prefix('=') {
        return split_values(strip_brackets(rest.trim()))
            .into_iter()
            .map(|v| Predicate::StrEquals(unquote(&v)))
            .collect();
    }
    split_values(strip_brackets(value_expr))
        .into_iter()
        .map(|v| Predicate::StrContains(unquote(&v)))
        .collect()
}

fn parse_geo_predicates(field: &str, value_expr: &str) -> EngineResult<Vec<Predicate>> {
    // Lists of shapes: `[(...), (...)]`.
    let shapes: Vec<String> = if value_expr.starts_with('[') && value_expr.ends_with(']') {
        let inner = &value_expr[1..value_expr.len() - 1];
        split_shapes(inner)
    } else {
        vec![value_expr.to_string()]
    };

    let mut out = Vec::new();
    for shape in shapes {
        let shape = shape.trim();
        let inner = shape
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| {
                EngineError::ClientError(format!(
                    "Value of field `{}` must be a geo tuple.",
                    field
                ))
            })?;
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();

        // Radius form: `lat, lng, radius km|mi`.
        let last = parts.last().copied().unwrap_or_default();
        if last.ends_with("km") || last.ends_with("mi") {
            if parts.len() != 3 {
                return Err(EngineError::ClientError(format!(
                    "Value of field `{}` must be `(lat, lng, radius km|mi)`.",
                    field
                )));
            }
            let lat = parse_coord(field, parts[0])?;
            let lng = parse_coord(field, parts[1])?;
            let (raw, unit_to_m): (&str, f64) = if let Some(r) = last.strip_suffix("km") {
                (r, 1000.0)
            } else {
                (last.strip_suffix("mi").expect("checked above"), 1609.34)
            };
            let radius = raw.trim().parse::<f64>().map_err(|_| {
                EngineError::ClientError(format!("Invalid radius in filter on `{}`.", field))
            })?;
            out.push(Predicate::GeoRadius {
                lat,
                lng,
                radius_m: radius * unit_to_m,
            });
            continue;
        }

        // Polygon form: pairs of coordinates.
        if parts.len() < 6 || parts.len() % 2 != 0 {
            return Err(EngineError::ClientError(format!(
                "Polygon filter on `{}` needs at least 3 coordinate pairs.",
                field
            )));
        }
        let mut vertices = Vec::with_capacity(parts.len() / 2);
        for pair in parts.chunks(2) {
            vertices.push((parse_coord(field, pair[0])?, parse_coord(field, pair[1])?));
        }
        out.push(Predicate::GeoPolygon(vertices));
    }
    Ok(out)
}

fn parse_coord(field: &str, raw: &str) -> EngineResult<f64> {
    raw.trim().parse::<f64>().map_err(|_| {
        EngineError::ClientError(format!("Invalid coordinate in filter on `{}`.", field))
    })
}

fn strip_brackets(expr: &str) -> &str {
    let expr = expr.trim();
    if expr.starts_with('[') && expr.ends_with(']') {
        &expr[1..expr.len() - 1]
    } else {
        expr
    }
}

/// Split a comma-separated value list, honoring backtick quoting.
fn split_values(inner: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in inner.chars() {
        match ch {
            '`' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => {
                let v = current.trim().to_string();
                if !v.is_empty() {
                    out.push(v);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let v = current.trim().to_string();
    if !v.is_empty() {
        out.push(v);
    }
    out
}

/// Split a list of parenthesized shapes.
fn split_shapes(inner: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in inner.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn find_unquoted(text: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    for (i, ch) in text.char_indices() {
        if ch == '`' {
            quoted = !quoted;
        } else if ch == needle && !quoted {
            return Some(i);
        }
    }
    None
}

fn unquote(value: &str) -> String {
    let v = value.trim();
    if v.len() >= 2 && v.starts_with('`') && v.ends_with('`') {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}

// ==================== Evaluation ====================

/// Access the evaluator needs from a collection. Implemented by `Collection`;
/// kept as a trait so the compiler stays free of storage dependencies.
pub trait FilterContext {
    fn all_ids(&self) -> BTreeSet<u32>;
    fn eval_leaf(&self, leaf: &FilterLeaf) -> EngineResult<BTreeSet<u32>>;
    fn leaf_matches(&self, leaf: &FilterLeaf, seq_id: u32) -> EngineResult<bool>;
}

/// Eager evaluation: materialize each leaf into a set and combine.
pub fn eval_filter<C: FilterContext + ?Sized>(
    node: &FilterNode,
    ctx: &C,
) -> EngineResult<BTreeSet<u32>> {
    match node {
        FilterNode::Leaf(leaf) => ctx.eval_leaf(leaf),
        FilterNode::Operator { op, left, right } => {
            let l = eval_filter(left.as_ref(), ctx)?;
            let r = eval_filter(right.as_ref(), ctx)?;
            Ok(match op {
                FilterOp::And => l.intersection(&r).copied().collect(),
                FilterOp::Or => l.union(&r).copied().collect(),
            })
        }
    }
}

/// Lazy evaluation: check one document against the tree.
pub fn filter_matches<C: FilterContext + ?Sized>(
    node: &FilterNode,
    ctx: &C,
    seq_id: u32,
) -> EngineResult<bool> {
    match node {
        FilterNode::Leaf(leaf) => ctx.leaf_matches(leaf, seq_id),
        FilterNode::Operator { op, left, right } => {
            let l = filter_matches(left.as_ref(), ctx, seq_id)?;
            match op {
                FilterOp::And => {
                    if !l {
                        return Ok(false);
                    }
                    filter_matches(right.as_ref(), ctx, seq_id)
                }
                FilterOp::Or => {
                    if l {
                        return Ok(true);
                    }
                    filter_matches(right.as_ref(), ctx, seq_id)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "books",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": "points", "type": "int32"},
                    {"name": "in_print", "type": "bool"},
                    {"name": "loc", "type": "geopoint"}
                ]
            }),
        )
        .unwrap()
    }

    fn leaf(node: &FilterNode) -> &FilterLeaf {
        match node {
            FilterNode::Leaf(l) => l,
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_numeric_operators() {
        let s = schema();
        let node = parse_filter("points:>=100", &s).unwrap();
        assert_eq!(
            leaf(&node).predicates,
            vec![Predicate::NumGreater { value: 100.0, inclusive: true }]
        );

        let node = parse_filter("points:[10..20]", &s).unwrap();
        assert_eq!(
            leaf(&node).predicates,
            vec![Predicate::NumRange { lo: 10.0, hi: 20.0 }]
        );

        let node = parse_filter("points:[1, 2, 3]", &s).unwrap();
        assert_eq!(leaf(&node).predicates.len(), 3);

        let node = parse_filter("points:!=[1,2]", &s).unwrap();
        assert_eq!(
            leaf(&node).predicates,
            vec![Predicate::NumNotEquals(1.0), Predicate::NumNotEquals(2.0)]
        );
    }

    #[test]
    fn test_string_operators() {
        let s = schema();
        let node = parse_filter("title:=sherlock", &s).unwrap();
        assert_eq!(
            leaf(&node).predicates,
            vec![Predicate::StrEquals("sherlock".into())]
        );

        let node = parse_filter("title:`left && right`", &s).unwrap();
        assert_eq!(
            leaf(&node).predicates,
            vec![Predicate::StrContains("left && right".into())]
        );
    }

    #[test]
    fn test_bool_values_are_checked() {
        let s = schema();
        assert!(parse_filter("in_print:true", &s).is_ok());
        let err = parse_filter("in_print:yes", &s).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_boolean_tree_precedence_left_assoc() {
        let s = schema();
        let node = parse_filter("points:1 || points:2 && points:3", &s).unwrap();
        // Same precedence, left-assoc: ((1 || 2) && 3)
        match node {
            FilterNode::Operator { op, left, .. } => {
                assert_eq!(op, FilterOp::And);
                assert!(matches!(*left, FilterNode::Operator { op: FilterOp::Or, .. }));
            }
            _ => panic!("expected operator root"),
        }

        let node = parse_filter("points:1 || (points:2 && points:3)", &s).unwrap();
        match node {
            FilterNode::Operator { op, .. } => assert_eq!(op, FilterOp::Or),
            _ => panic!("expected operator root"),
        }
    }

    #[test]
    fn test_geo_radius_and_polygon() {
        let s = schema();
        let node = parse_filter("loc:(48.85, 2.35, 5.1 km)", &s).unwrap();
        match &leaf(&node).predicates[0] {
            Predicate::GeoRadius { lat, lng, radius_m } => {
                assert!((lat - 48.85).abs() < 1e-9);
                assert!((lng - 2.35).abs() < 1e-9);
                assert!((radius_m - 5100.0).abs() < 1.0);
            }
            other => panic!("unexpected predicate {:?}", other),
        }

        let node = parse_filter("loc:(0,0, 0,10, 10,10, 10,0)", &s).unwrap();
        assert!(matches!(leaf(&node).predicates[0], Predicate::GeoPolygon(_)));
    }

    #[test]
    fn test_id_leaf() {
        let s = schema();
        let node = parse_filter("id:[doc1, doc2]", &s).unwrap();
        assert_eq!(
            leaf(&node).predicates,
            vec![Predicate::Id("doc1".into()), Predicate::Id("doc2".into())]
        );

        let err = parse_filter("id:!=doc1", &s).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_reference_leaf() {
        let s = schema();
        let node = parse_filter("$authors(name:Doyle)", &s).unwrap();
        assert_eq!(
            leaf(&node).reference,
            Some(("authors".into(), "name:Doyle".into()))
        );
        assert_eq!(node.referenced_collections(), vec!["authors".to_string()]);
    }

    #[test]
    fn test_unknown_field_is_404() {
        let err = parse_filter("missing:1", &schema()).unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[test]
    fn test_type_mismatch_is_400() {
        let err = parse_filter("points:abc", &schema()).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_token_cap() {
        let s = schema();
        let expr = (0..60)
            .map(|i| format!("points:{}", i))
            .collect::<Vec<_>>()
            .join(" || ");
        let err = parse_filter(&expr, &s).unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(err.to_string().contains("too many"));
    }

    #[test]
    fn test_unbalanced_parens() {
        assert!(parse_filter("(points:1 && points:2", &schema()).is_err());
        assert!(parse_filter("points:1) && points:2", &schema()).is_err());
    }

    struct FakeContext;

    impl FilterContext for FakeContext {
        fn all_ids(&self) -> BTreeSet<u32> {
            (0..10).collect()
        }

        fn eval_leaf(&self, leaf: &FilterLeaf) -> EngineResult<BTreeSet<u32>> {
            // points:N matches ids <= N for the test.
            match leaf.predicates.first() {
                Some(Predicate::NumEquals(n)) => Ok((0..=(*n as u32)).collect()),
                _ => Ok(BTreeSet::new()),
            }
        }

        fn leaf_matches(&self, leaf: &FilterLeaf, seq_id: u32) -> EngineResult<bool> {
            Ok(self.eval_leaf(leaf)?.contains(&seq_id))
        }
    }

    #[test]
    fn test_eager_and_lazy_eval_agree() {
        let s = schema();
        let node = parse_filter("points:3 || points:5 && points:4", &s).unwrap();
        let ctx = FakeContext;
        let eager = eval_filter(&node, &ctx).unwrap();
        for seq_id in 0..10 {
            assert_eq!(
                eager.contains(&seq_id),
                filter_matches(&node, &ctx, seq_id).unwrap(),
                "mismatch at {}",
                seq_id
            );
        }
    }
}

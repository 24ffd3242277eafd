//! Rule-based connection filter.
//!
//! Rules are parsed from a small DSL (one-line and structured braced forms,
//! with `$macro` expansion) and compiled into a three-level lookup structure:
//! source IP, then destination field (IP / SNI / CN / Host / URI), then
//! destination port. Every level carries an exact-match map, an Aho-Corasick
//! substring automaton, and an optional catch-all entry. The tree is built
//! once at startup and is immutable afterwards, so concurrent lookups from
//! the workers need no locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use thiserror::Error;

use crate::config::{ConfigError, ConnOpts};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("line {line}: no such macro '{name}'")]
    UnknownMacro { line: usize, name: String },
    #[error("line {line}: {source}")]
    Option {
        line: usize,
        #[source]
        source: ConfigError,
    },
}

fn parse_err(line: usize, msg: impl Into<String>) -> FilterError {
    FilterError::Parse {
        line,
        msg: msg.into(),
    }
}

/// Primary action of a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Divert,
    Split,
    Pass,
    Block,
    /// No traffic effect; only raises or lowers log bits.
    Match,
}

/// Three-state log toggle: leave the connection's setting alone, force it
/// off, or force it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogToggle {
    #[default]
    Keep,
    Disable,
    Enable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogActions {
    pub connect: LogToggle,
    pub master: LogToggle,
    pub cert: LogToggle,
    pub content: LogToggle,
    pub pcap: LogToggle,
}

impl LogActions {
    fn set_all(&mut self, toggle: LogToggle) {
        self.connect = toggle;
        self.master = toggle;
        self.cert = toggle;
        self.content = toggle;
        self.pcap = toggle;
    }
}

/// The leaf of the lookup tree: what to do with a matching connection.
#[derive(Debug, Clone)]
pub struct FilterAction {
    pub verb: Verb,
    pub log: LogActions,
    /// Structured rules may replace the connection's option bundle.
    pub conn_opts: Option<Arc<ConnOpts>>,
    /// More specific rules carry higher precedence; ties favor the rule
    /// inserted first.
    pub precedence: u32,
}

/// Destination field a site pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    DstIp,
    Sni,
    Cn,
    Host,
    Uri,
}

const SITE_KINDS: [SiteKind; 5] = [
    SiteKind::DstIp,
    SiteKind::Sni,
    SiteKind::Cn,
    SiteKind::Host,
    SiteKind::Uri,
];

/// A site or port pattern: `*` matches anything, a trailing `*` makes a
/// substring pattern, anything else matches exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    All,
    Exact(String),
    Substring(String),
}

impl Pattern {
    pub fn parse(spec: &str) -> Pattern {
        if spec == "*" {
            return Pattern::All;
        }
        match spec.strip_suffix('*') {
            Some("") => Pattern::All,
            Some(prefix) => Pattern::Substring(prefix.to_string()),
            None => Pattern::Exact(spec.to_string()),
        }
    }

    fn is_all(&self) -> bool {
        matches!(self, Pattern::All)
    }
}

/// One parsed rule, before compilation into the tree.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub src_ip: Pattern,
    /// Destination patterns; empty means catch-all in every field kind.
    pub sites: Vec<(SiteKind, Pattern)>,
    pub port: Option<Pattern>,
    pub action: FilterAction,
}

// ---------------------------------------------------------------------------
// DSL parsing
// ---------------------------------------------------------------------------

fn verb_for(name: &str) -> Option<Verb> {
    match name {
        "Divert" => Some(Verb::Divert),
        "Split" => Some(Verb::Split),
        "Pass" => Some(Verb::Pass),
        "Block" => Some(Verb::Block),
        "Match" => Some(Verb::Match),
        _ => None,
    }
}

fn site_kind_for(name: &str) -> Option<SiteKind> {
    match name {
        "ip" | "DstIp" => Some(SiteKind::DstIp),
        "sni" | "SNI" => Some(SiteKind::Sni),
        "cn" | "CN" => Some(SiteKind::Cn),
        "host" | "Host" => Some(SiteKind::Host),
        "uri" | "URI" => Some(SiteKind::Uri),
        _ => None,
    }
}

fn log_token(log: &mut LogActions, token: &str) -> bool {
    let (toggle, name) = match token.strip_prefix('!') {
        Some(rest) => (LogToggle::Disable, rest),
        None => (LogToggle::Enable, token),
    };
    match name {
        "connect" => log.connect = toggle,
        "master" => log.master = toggle,
        "cert" => log.cert = toggle,
        "content" => log.content = toggle,
        "pcap" => log.pcap = toggle,
        "*" => log.set_all(toggle),
        _ => return false,
    }
    true
}

/// Parses rule lines into [`FilterRule`]s.
///
/// Holds macro definitions (`$name value value …`) seen so far; referencing a
/// macro in a rule expands it into one rule per value.
#[derive(Default)]
pub struct RuleParser {
    macros: BTreeMap<String, Vec<String>>,
    rules: Vec<FilterRule>,
}

impl RuleParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whole rules document (one-line rules, macro definitions, and
    /// `FilterRule { … }` blocks).
    pub fn parse_lines<'a, I>(
        mut self,
        lines: I,
        base_opts: &Arc<ConnOpts>,
    ) -> Result<Vec<FilterRule>, FilterError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut iter = lines.into_iter().enumerate();
        while let Some((num, raw)) = iter.next() {
            let line_num = num + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('$') {
                self.define_macro(rest, line_num)?;
                continue;
            }
            if line.starts_with("FilterRule") {
                let mut block = Vec::new();
                if !line.ends_with('{') {
                    return Err(parse_err(line_num, "expected '{' after FilterRule"));
                }
                let mut closed = false;
                for (bnum, braw) in iter.by_ref() {
                    let bline = braw.trim();
                    if bline == "}" {
                        closed = true;
                        break;
                    }
                    block.push((bnum + 1, bline.to_string()));
                }
                if !closed {
                    return Err(parse_err(line_num, "unterminated FilterRule block"));
                }
                self.parse_structured(&block, line_num, base_opts)?;
                continue;
            }
            self.parse_one_line(line, line_num)?;
        }
        Ok(self.rules)
    }

    fn define_macro(&mut self, rest: &str, line_num: usize) -> Result<(), FilterError> {
        let mut it = rest.split_whitespace();
        let name = it
            .next()
            .ok_or_else(|| parse_err(line_num, "empty macro definition"))?;
        let values: Vec<String> = it.map(str::to_string).collect();
        if values.is_empty() {
            return Err(parse_err(line_num, "macro without values"));
        }
        // Macros may not reference macros.
        if values.iter().any(|v| v.starts_with('$')) {
            return Err(parse_err(line_num, "macro values may not reference macros"));
        }
        self.macros.insert(format!("${name}"), values);
        Ok(())
    }

    fn parse_one_line(&mut self, line: &str, line_num: usize) -> Result<(), FilterError> {
        let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();

        // Expand the first macro reference and recurse once per value.
        if let Some(pos) = tokens.iter().position(|t| t.starts_with('$')) {
            let values = self
                .macros
                .get(&tokens[pos])
                .cloned()
                .ok_or_else(|| FilterError::UnknownMacro {
                    line: line_num,
                    name: tokens[pos].clone(),
                })?;
            for value in values {
                let mut expanded = tokens.clone();
                expanded[pos] = value;
                self.parse_one_line(&expanded.join(" "), line_num)?;
            }
            return Ok(());
        }

        let verb = verb_for(&tokens[0])
            .ok_or_else(|| parse_err(line_num, format!("unknown action '{}'", tokens[0])))?;

        let mut rule = FilterRule {
            src_ip: Pattern::All,
            sites: Vec::new(),
            port: None,
            action: FilterAction {
                verb,
                log: LogActions::default(),
                conn_opts: None,
                precedence: 0,
            },
        };

        let mut i = 1;
        while i < tokens.len() {
            match tokens[i].as_str() {
                "*" => i += 1,
                "from" => {
                    i += 1;
                    match tokens.get(i).map(String::as_str) {
                        Some("ip") => {
                            i += 1;
                            let spec = tokens
                                .get(i)
                                .ok_or_else(|| parse_err(line_num, "missing ip after 'from ip'"))?;
                            rule.src_ip = Pattern::parse(spec);
                            if !rule.src_ip.is_all() {
                                rule.action.precedence += 1;
                            }
                            i += 1;
                        }
                        Some("*") => i += 1,
                        other => {
                            return Err(parse_err(
                                line_num,
                                format!("expected 'ip' or '*' after 'from', got {other:?}"),
                            ))
                        }
                    }
                }
                "to" => {
                    i += 1;
                    match tokens.get(i).map(String::as_str) {
                        Some(name) if site_kind_for(name).is_some() => {
                            let kind = site_kind_for(name).unwrap();
                            i += 1;
                            let spec = tokens.get(i).ok_or_else(|| {
                                parse_err(line_num, format!("missing site after 'to {name}'"))
                            })?;
                            rule.sites.push((kind, Pattern::parse(spec)));
                            rule.action.precedence += 1;
                            i += 1;
                            if tokens.get(i).map(String::as_str) == Some("port") {
                                i += 1;
                                let pspec = tokens
                                    .get(i)
                                    .ok_or_else(|| parse_err(line_num, "missing port"))?;
                                rule.port = Some(Pattern::parse(pspec));
                                rule.action.precedence += 1;
                                i += 1;
                            }
                        }
                        Some("port") => {
                            i += 1;
                            let pspec = tokens
                                .get(i)
                                .ok_or_else(|| parse_err(line_num, "missing port"))?;
                            rule.port = Some(Pattern::parse(pspec));
                            rule.action.precedence += 1;
                            i += 1;
                        }
                        Some("*") => i += 1,
                        other => {
                            return Err(parse_err(
                                line_num,
                                format!("expected a site field after 'to', got {other:?}"),
                            ))
                        }
                    }
                }
                "log" => {
                    i += 1;
                    rule.action.precedence += 1;
                    let mut seen = false;
                    while let Some(tok) = tokens.get(i) {
                        if !log_token(&mut rule.action.log, tok) {
                            break;
                        }
                        seen = true;
                        i += 1;
                    }
                    if !seen {
                        return Err(parse_err(line_num, "missing log targets after 'log'"));
                    }
                }
                other => {
                    return Err(parse_err(line_num, format!("unexpected token '{other}'")));
                }
            }
        }

        self.rules.push(rule);
        Ok(())
    }

    /// Parse a `FilterRule { … }` block: one `Key Value` pair per line, with
    /// connection-option keys collected into a per-rule option override.
    fn parse_structured(
        &mut self,
        block: &[(usize, String)],
        line_num: usize,
        base_opts: &Arc<ConnOpts>,
    ) -> Result<(), FilterError> {
        let mut verb = None;
        let mut rule_src = Pattern::All;
        let mut sites = Vec::new();
        let mut port = None;
        let mut log = LogActions::default();
        let mut precedence = 0u32;
        let mut opts_override: Option<ConnOpts> = None;

        for (bnum, bline) in block {
            if bline.is_empty() || bline.starts_with('#') {
                continue;
            }
            let (key, value) = bline
                .split_once(char::is_whitespace)
                .ok_or_else(|| parse_err(*bnum, "expected 'Key Value'"))?;
            let value = value.trim();
            match key {
                "Action" => {
                    verb = Some(
                        verb_for(value)
                            .ok_or_else(|| parse_err(*bnum, format!("unknown action '{value}'")))?,
                    );
                }
                "SrcIp" => {
                    rule_src = Pattern::parse(value);
                    if !rule_src.is_all() {
                        precedence += 1;
                    }
                }
                "DstIp" | "SNI" | "CN" | "Host" | "URI" => {
                    sites.push((site_kind_for(key).unwrap(), Pattern::parse(value)));
                    precedence += 1;
                }
                "DstPort" => {
                    port = Some(Pattern::parse(value));
                    precedence += 1;
                }
                "Log" => {
                    precedence += 1;
                    for tok in value.split_whitespace() {
                        if !log_token(&mut log, tok) {
                            return Err(parse_err(*bnum, format!("unknown log target '{tok}'")));
                        }
                    }
                }
                conn_key => {
                    let opts = opts_override.get_or_insert_with(|| (**base_opts).clone());
                    opts.set(conn_key, value).map_err(|source| FilterError::Option {
                        line: *bnum,
                        source,
                    })?;
                }
            }
        }

        let verb =
            verb.ok_or_else(|| parse_err(line_num, "FilterRule block without an Action"))?;
        self.rules.push(FilterRule {
            src_ip: rule_src,
            sites,
            port,
            action: FilterAction {
                verb,
                log,
                conn_opts: opts_override.map(Arc::new),
                precedence,
            },
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compiled lookup tree
// ---------------------------------------------------------------------------

/// Exact map + substring automaton + catch-all, the repeating unit of the
/// tree. Values keep insertion order in the substring index so that ties on
/// precedence resolve to the earlier rule.
#[derive(Debug)]
struct StagedIndex<T> {
    exact: BTreeMap<String, T>,
    substr_patterns: Vec<String>,
    substr_values: Vec<T>,
    substr_ac: Option<AhoCorasick>,
    all: Option<T>,
}

impl<T> Default for StagedIndex<T> {
    fn default() -> Self {
        StagedIndex {
            exact: BTreeMap::new(),
            substr_patterns: Vec::new(),
            substr_values: Vec::new(),
            substr_ac: None,
            all: None,
        }
    }
}

impl<T> StagedIndex<T> {
    fn entry(&mut self, pattern: &Pattern) -> &mut T
    where
        T: Default,
    {
        match pattern {
            Pattern::All => self.all.get_or_insert_with(T::default),
            Pattern::Exact(s) => self.exact.entry(s.clone()).or_default(),
            Pattern::Substring(s) => {
                let pos = match self.substr_patterns.iter().position(|p| p == s) {
                    Some(pos) => pos,
                    None => {
                        self.substr_patterns.push(s.clone());
                        self.substr_values.push(T::default());
                        self.substr_values.len() - 1
                    }
                };
                &mut self.substr_values[pos]
            }
        }
    }

    fn freeze(&mut self) {
        if !self.substr_patterns.is_empty() {
            // Patterns are plain bytes; building cannot fail for them.
            self.substr_ac = AhoCorasick::new(&self.substr_patterns).ok();
        }
    }

    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.substr_patterns.is_empty() && self.all.is_none()
    }

    /// Three-stage lookup: exact, then best substring hit, then catch-all.
    /// The first stage that yields a value wins.
    fn find(&self, key: &str, better: impl Fn(&T, &T) -> bool) -> Option<&T> {
        if let Some(v) = self.exact.get(key) {
            return Some(v);
        }
        if let Some(ac) = &self.substr_ac {
            let mut best: Option<&T> = None;
            for m in ac.find_overlapping_iter(key) {
                let candidate = &self.substr_values[m.pattern().as_usize()];
                if best.map_or(true, |b| better(candidate, b)) {
                    best = Some(candidate);
                }
            }
            if best.is_some() {
                return best;
            }
        }
        self.all.as_ref()
    }
}

/// Prefer strictly higher precedence; equal precedence keeps the incumbent
/// (earlier rules win ties).
fn higher_precedence(candidate: &FilterAction, incumbent: &FilterAction) -> bool {
    candidate.precedence > incumbent.precedence
}

#[derive(Debug, Default)]
struct SiteNode {
    action: Option<FilterAction>,
    ports: StagedIndex<Option<FilterAction>>,
}

impl SiteNode {
    fn store(&mut self, slot: StoreSlot, action: &FilterAction) {
        let target: &mut Option<FilterAction> = match slot {
            StoreSlot::Site => &mut self.action,
            StoreSlot::Port(pattern) => self.ports.entry(&pattern),
        };
        // Re-insertion under the same key updates the leaf iff the new
        // precedence is not lower than the stored one.
        match target {
            Some(existing) if existing.precedence > action.precedence => {}
            _ => *target = Some(action.clone()),
        }
    }
}

enum StoreSlot {
    Site,
    Port(Pattern),
}

/// The per-source-IP group of destination-field indexes.
#[derive(Debug, Default)]
struct FilterList {
    dstip: StagedIndex<SiteNode>,
    sni: StagedIndex<SiteNode>,
    cn: StagedIndex<SiteNode>,
    host: StagedIndex<SiteNode>,
    uri: StagedIndex<SiteNode>,
}

impl FilterList {
    fn index_mut(&mut self, kind: SiteKind) -> &mut StagedIndex<SiteNode> {
        match kind {
            SiteKind::DstIp => &mut self.dstip,
            SiteKind::Sni => &mut self.sni,
            SiteKind::Cn => &mut self.cn,
            SiteKind::Host => &mut self.host,
            SiteKind::Uri => &mut self.uri,
        }
    }

    fn index(&self, kind: SiteKind) -> &StagedIndex<SiteNode> {
        match kind {
            SiteKind::DstIp => &self.dstip,
            SiteKind::Sni => &self.sni,
            SiteKind::Cn => &self.cn,
            SiteKind::Host => &self.host,
            SiteKind::Uri => &self.uri,
        }
    }

    fn freeze(&mut self) {
        for kind in SITE_KINDS {
            let idx = self.index_mut(kind);
            idx.freeze();
            for node in idx
                .exact
                .values_mut()
                .chain(idx.substr_values.iter_mut())
                .chain(idx.all.iter_mut())
            {
                node.ports.freeze();
            }
        }
    }
}

/// The compiled, immutable rule tree.
#[derive(Debug, Default)]
pub struct FilterTree {
    src: StagedIndex<FilterList>,
    rule_count: usize,
}

impl FilterTree {
    /// Compile parsed rules. Insertion order is meaningful: on equal
    /// precedence the earlier rule keeps its leaf.
    pub fn build(rules: &[FilterRule]) -> FilterTree {
        let mut tree = FilterTree::default();
        for rule in rules {
            tree.insert(rule);
        }
        tree.src.freeze();
        for list in tree
            .src
            .exact
            .values_mut()
            .chain(tree.src.substr_values.iter_mut())
            .chain(tree.src.all.iter_mut())
        {
            list.freeze();
        }
        tree.rule_count = rules.len();
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    fn insert(&mut self, rule: &FilterRule) {
        let list = self.src.entry(&rule.src_ip);

        // A rule without a destination clause applies to every field kind.
        let sites: Vec<(SiteKind, Pattern)> = if rule.sites.is_empty() {
            SITE_KINDS.iter().map(|&k| (k, Pattern::All)).collect()
        } else {
            rule.sites.clone()
        };

        for (kind, pattern) in &sites {
            let node = list.index_mut(*kind).entry(pattern);
            match &rule.port {
                Some(port) => node.store(StoreSlot::Port(port.clone()), &rule.action),
                None => node.store(StoreSlot::Site, &rule.action),
            }
        }
    }

    /// Evaluate the tree for one connection event.
    ///
    /// `fields` carries the destination values known at this phase (e.g. SNI
    /// and CN on TLS accept, Host and URI once a request header is parsed).
    /// Rules below `min_precedence` cannot win: a connection's applied
    /// precedence only ever goes up.
    pub fn lookup(
        &self,
        src_ip: &str,
        dst_port: &str,
        fields: &[(SiteKind, &str)],
        min_precedence: u32,
    ) -> Option<FilterAction> {
        // Source stages are tried in order; the first stage whose field
        // lookups produce any action decides.
        if let Some(list) = self.src.exact.get(src_ip) {
            if let Some(action) = self.lookup_fields(list, dst_port, fields, min_precedence) {
                return Some(action);
            }
        }
        if let Some(ac) = &self.src.substr_ac {
            for m in ac.find_overlapping_iter(src_ip) {
                let list = &self.src.substr_values[m.pattern().as_usize()];
                if let Some(action) = self.lookup_fields(list, dst_port, fields, min_precedence) {
                    return Some(action);
                }
            }
        }
        if let Some(list) = &self.src.all {
            if let Some(action) = self.lookup_fields(list, dst_port, fields, min_precedence) {
                return Some(action);
            }
        }
        None
    }

    fn lookup_fields(
        &self,
        list: &FilterList,
        dst_port: &str,
        fields: &[(SiteKind, &str)],
        min_precedence: u32,
    ) -> Option<FilterAction> {
        let mut winner: Option<&FilterAction> = None;
        for (kind, value) in fields {
            let Some(node) = list.index(*kind).find(value, |a, b| {
                site_precedence(a).unwrap_or(0) > site_precedence(b).unwrap_or(0)
            }) else {
                continue;
            };
            if let Some(action) = resolve_node(node, dst_port, min_precedence) {
                if winner.map_or(true, |w| higher_precedence(action, w)) {
                    winner = Some(action);
                }
            }
        }
        winner.cloned()
    }
}

fn site_precedence(node: &SiteNode) -> Option<u32> {
    node.action.as_ref().map(|a| a.precedence)
}

/// Resolve a matched site node to an action: a matching port sub-rule
/// replaces the site-level action.
fn resolve_node<'a>(
    node: &'a SiteNode,
    dst_port: &str,
    min_precedence: u32,
) -> Option<&'a FilterAction> {
    if !node.ports.is_empty() {
        if let Some(Some(action)) = node.ports.find(dst_port, |a, b| match (a, b) {
            (Some(a), Some(b)) => higher_precedence(a, b),
            (Some(_), None) => true,
            _ => false,
        }) {
            if action.precedence >= min_precedence {
                return Some(action);
            }
        }
        // Port rules exist but none matched; fall back to the site action.
    }
    match &node.action {
        Some(action) if action.precedence >= min_precedence => Some(action),
        _ => None,
    }
}

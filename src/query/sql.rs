use crate::query::result::Value;
use std::fmt::Write;

/// Name of one intermediate relation (CTE) in a compiled query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageRef(String);

impl StageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Column `name` of this stage.
    pub fn col(&self, name: &str) -> Expr {
        Expr::qualified(&self.0, name)
    }
}

impl std::fmt::Display for StageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    And,
    Or,
    Plus,
    Minus,
    Mul,
    Div,
    Concat,
}

impl BinaryOp {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Concat => "||",
        }
    }

    const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Gt | Self::GtEq | Self::Lt | Self::LtEq
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column {
        table: Option<String>,
        name: String,
    },
    /// `*` or `table.*`
    Star(Option<String>),
    /// Inlined literal. Only used for values produced by the compiler itself.
    Literal(Value),
    /// Positional parameter bound at execution time.
    Param(Value),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Func {
        name: &'static str,
        args: Vec<Expr>,
    },
    /// Aggregate call with an optional ordering, e.g. `first(x ORDER BY ts)`.
    Aggregate {
        name: &'static str,
        args: Vec<Expr>,
        order_by: Vec<OrderItem>,
    },
    Cast {
        expr: Box<Expr>,
        ty: &'static str,
        try_cast: bool,
    },
    Case {
        whens: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn col(name: &str) -> Self {
        Self::Column {
            table: None,
            name: name.to_string(),
        }
    }

    pub fn qualified(table: &str, name: &str) -> Self {
        Self::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn text(s: &str) -> Self {
        Self::Literal(Value::Text(s.to_string()))
    }

    pub const fn int(i: i64) -> Self {
        Self::Literal(Value::Int(i))
    }

    pub const fn float(f: f64) -> Self {
        Self::Literal(Value::Float(f))
    }

    pub fn param(value: impl Into<Value>) -> Self {
        Self::Param(value.into())
    }

    pub fn func(name: &'static str, args: Vec<Self>) -> Self {
        Self::Func { name, args }
    }

    pub fn agg(name: &'static str, arg: Self) -> Self {
        Self::Aggregate {
            name,
            args: vec![arg],
            order_by: Vec::new(),
        }
    }

    pub fn cast(self, ty: &'static str) -> Self {
        Self::Cast {
            expr: Box::new(self),
            ty,
            try_cast: false,
        }
    }

    pub fn try_cast(self, ty: &'static str) -> Self {
        Self::Cast {
            expr: Box::new(self),
            ty,
            try_cast: true,
        }
    }

    fn binary(self, op: BinaryOp, right: Self) -> Self {
        Self::Binary {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Self) -> Self {
        self.binary(BinaryOp::Eq, right)
    }

    pub fn not_eq(self, right: Self) -> Self {
        self.binary(BinaryOp::NotEq, right)
    }

    pub fn gt(self, right: Self) -> Self {
        self.binary(BinaryOp::Gt, right)
    }

    pub fn gt_eq(self, right: Self) -> Self {
        self.binary(BinaryOp::GtEq, right)
    }

    pub fn lt(self, right: Self) -> Self {
        self.binary(BinaryOp::Lt, right)
    }

    pub fn lt_eq(self, right: Self) -> Self {
        self.binary(BinaryOp::LtEq, right)
    }

    pub fn and(self, right: Self) -> Self {
        self.binary(BinaryOp::And, right)
    }

    pub fn or(self, right: Self) -> Self {
        self.binary(BinaryOp::Or, right)
    }

    pub fn plus(self, right: Self) -> Self {
        self.binary(BinaryOp::Plus, right)
    }

    pub fn minus(self, right: Self) -> Self {
        self.binary(BinaryOp::Minus, right)
    }

    pub fn mul(self, right: Self) -> Self {
        self.binary(BinaryOp::Mul, right)
    }

    pub fn div(self, right: Self) -> Self {
        self.binary(BinaryOp::Div, right)
    }

    pub fn concat(self, right: Self) -> Self {
        self.binary(BinaryOp::Concat, right)
    }

    pub fn is_null(self) -> Self {
        Self::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Self::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Join predicates with `AND`; `None` when there are none.
    pub fn conjunction(exprs: impl IntoIterator<Item = Self>) -> Option<Self> {
        exprs.into_iter().reduce(Self::and)
    }

    pub fn disjunction(exprs: impl IntoIterator<Item = Self>) -> Option<Self> {
        exprs.into_iter().reduce(Self::or)
    }

    pub fn alias(self, alias: &str) -> SelectItem {
        SelectItem {
            expr: self,
            alias: Some(alias.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

impl OrderItem {
    pub const fn asc(expr: Expr) -> Self {
        Self {
            expr,
            descending: false,
        }
    }

    pub const fn desc(expr: Expr) -> Self {
        Self {
            expr,
            descending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl From<Expr> for SelectItem {
    fn from(expr: Expr) -> Self {
        Self { expr, alias: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Named { name: String, alias: Option<String> },
    Subquery { relation: Box<Relation>, alias: String },
}

impl TableRef {
    pub fn named(name: &str) -> Self {
        Self::Named {
            name: name.to_string(),
            alias: None,
        }
    }

    pub fn aliased(name: &str, alias: &str) -> Self {
        Self::Named {
            name: name.to_string(),
            alias: Some(alias.to_string()),
        }
    }

    pub fn stage(stage: &StageRef) -> Self {
        Self::named(stage.name())
    }

    pub fn subquery(relation: Relation, alias: &str) -> Self {
        Self::Subquery {
            relation: Box::new(relation),
            alias: alias.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub items: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<usize>,
}

impl Select {
    pub const fn new(from: TableRef) -> Self {
        Self {
            items: Vec::new(),
            from,
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn item(mut self, item: impl Into<SelectItem>) -> Self {
        self.items.push(item.into());
        self
    }

    pub fn items(mut self, items: impl IntoIterator<Item = SelectItem>) -> Self {
        self.items.extend(items);
        self
    }

    pub fn join(mut self, kind: JoinKind, table: TableRef, on: Option<Expr>) -> Self {
        self.joins.push(Join { kind, table, on });
        self
    }

    pub fn filter(mut self, filter: Option<Expr>) -> Self {
        self.filter = filter;
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn order_by(mut self, items: Vec<OrderItem>) -> Self {
        self.order_by = items;
        self
    }

    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Select(Box<Select>),
    UnionAll(Vec<Relation>),
}

impl From<Select> for Relation {
    fn from(select: Select) -> Self {
        Self::Select(Box::new(select))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub stage: StageRef,
    pub relation: Relation,
}

/// A full query: a linear list of stages followed by the final relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub ctes: Vec<Cte>,
    pub body: Relation,
}

impl Query {
    pub fn stage_names(&self) -> Vec<&str> {
        self.ctes.iter().map(|c| c.stage.name()).collect()
    }

    /// Render the query to DuckDB SQL plus its positional parameters.
    ///
    /// Request values are carried as [`Expr::Param`] and become `?`
    /// placeholders, collected in text order so the list lines up with them.
    pub fn render(&self) -> (String, Vec<Value>) {
        let mut r = Renderer::default();
        if !self.ctes.is_empty() {
            r.sql.push_str("WITH ");
            for (i, cte) in self.ctes.iter().enumerate() {
                if i > 0 {
                    r.sql.push_str(",\n");
                }
                let _ = write!(r.sql, "{} AS (", cte.stage);
                r.relation(&cte.relation);
                r.sql.push(')');
            }
            r.sql.push('\n');
        }
        r.relation(&self.body);
        (r.sql, r.params)
    }
}

#[derive(Default)]
struct Renderer {
    sql: String,
    params: Vec<Value>,
}

impl Renderer {
    fn relation(&mut self, relation: &Relation) {
        match relation {
            Relation::Select(select) => self.select(select),
            Relation::UnionAll(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(" UNION ALL ");
                    }
                    self.relation(part);
                }
            }
        }
    }

    fn select(&mut self, select: &Select) {
        self.sql.push_str("SELECT ");
        for (i, item) in select.items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(&item.expr);
            if let Some(alias) = &item.alias {
                let _ = write!(self.sql, " AS {alias}");
            }
        }
        self.sql.push_str(" FROM ");
        self.table(&select.from);
        for join in &select.joins {
            self.sql.push_str(match join.kind {
                JoinKind::Inner => " JOIN ",
                JoinKind::Left => " LEFT JOIN ",
                JoinKind::Cross => " CROSS JOIN ",
            });
            self.table(&join.table);
            if let Some(on) = &join.on {
                self.sql.push_str(" ON ");
                self.expr(on);
            }
        }
        if let Some(filter) = &select.filter {
            self.sql.push_str(" WHERE ");
            self.expr(filter);
        }
        if !select.group_by.is_empty() {
            self.sql.push_str(" GROUP BY ");
            self.list(&select.group_by);
        }
        if !select.order_by.is_empty() {
            self.sql.push_str(" ORDER BY ");
            self.order(&select.order_by);
        }
        if let Some(limit) = select.limit {
            let _ = write!(self.sql, " LIMIT {limit}");
        }
    }

    fn table(&mut self, table: &TableRef) {
        match table {
            TableRef::Named { name, alias } => {
                self.sql.push_str(name);
                if let Some(alias) = alias {
                    let _ = write!(self.sql, " AS {alias}");
                }
            }
            TableRef::Subquery { relation, alias } => {
                self.sql.push('(');
                self.relation(relation);
                let _ = write!(self.sql, ") AS {alias}");
            }
        }
    }

    fn list(&mut self, exprs: &[Expr]) {
        for (i, e) in exprs.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(e);
        }
    }

    fn order(&mut self, items: &[OrderItem]) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(&item.expr);
            self.sql
                .push_str(if item.descending { " DESC" } else { " ASC" });
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Column { table, name } => {
                if let Some(table) = table {
                    let _ = write!(self.sql, "{table}.");
                }
                self.sql.push_str(name);
            }
            Expr::Star(table) => {
                if let Some(table) = table {
                    let _ = write!(self.sql, "{table}.");
                }
                self.sql.push('*');
            }
            Expr::Literal(value) => self.literal(value),
            Expr::Param(value) => {
                self.sql.push('?');
                self.params.push(value.clone());
            }
            Expr::Binary { left, op, right } => {
                if op.is_comparison() {
                    self.expr(left);
                    let _ = write!(self.sql, " {} ", op.as_sql());
                    self.expr(right);
                } else {
                    self.sql.push('(');
                    self.expr(left);
                    let _ = write!(self.sql, " {} ", op.as_sql());
                    self.expr(right);
                    self.sql.push(')');
                }
            }
            Expr::Not(inner) => {
                self.sql.push_str("NOT (");
                self.expr(inner);
                self.sql.push(')');
            }
            Expr::IsNull { expr, negated } => {
                self.expr(expr);
                self.sql
                    .push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::Func { name, args } => {
                let _ = write!(self.sql, "{name}(");
                self.list(args);
                self.sql.push(')');
            }
            Expr::Aggregate {
                name,
                args,
                order_by,
            } => {
                let _ = write!(self.sql, "{name}(");
                self.list(args);
                if !order_by.is_empty() {
                    self.sql.push_str(" ORDER BY ");
                    self.order(order_by);
                }
                self.sql.push(')');
            }
            Expr::Cast { expr, ty, try_cast } => {
                self.sql
                    .push_str(if *try_cast { "TRY_CAST(" } else { "CAST(" });
                self.expr(expr);
                let _ = write!(self.sql, " AS {ty})");
            }
            Expr::Case { whens, otherwise } => {
                self.sql.push_str("CASE");
                for (cond, then) in whens {
                    self.sql.push_str(" WHEN ");
                    self.expr(cond);
                    self.sql.push_str(" THEN ");
                    self.expr(then);
                }
                if let Some(otherwise) = otherwise {
                    self.sql.push_str(" ELSE ");
                    self.expr(otherwise);
                }
                self.sql.push_str(" END");
            }
        }
    }

    fn literal(&mut self, value: &Value) {
        match value {
            Value::Null => self.sql.push_str("NULL"),
            Value::Int(i) => {
                let _ = write!(self.sql, "{i}");
            }
            Value::Float(f) => {
                let _ = write!(self.sql, "{f:?}");
            }
            Value::Text(s) => {
                let _ = write!(self.sql, "'{}'", s.replace('\'', "''"));
            }
        }
    }
}

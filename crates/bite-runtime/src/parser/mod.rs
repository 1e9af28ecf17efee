//! Recursive-descent / Pratt parser
//!
//! Tokens → AST. Declarations are parsed by recursive descent; expressions
//! by precedence climbing over the table in spec §4.3. On error the parser
//! enters panic mode, synchronizes on `;` or a declaration-starter keyword,
//! and keeps going so a single pass can surface every syntax error.

use crate::ast::*;
use crate::diagnostic::Diagnostic;
use crate::interner::{Interner, Symbol};
use crate::span::Span;
use crate::token::{Token, TokenKind};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ids: NodeIdGen,
    diagnostics: Vec<Diagnostic>,
    interner: &'a Interner,
}

type PResult<T> = Result<T, ()>;

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, interner: &'a Interner) -> Self {
        Self {
            tokens,
            pos: 0,
            ids: NodeIdGen::default(),
            diagnostics: Vec::new(),
            interner,
        }
    }

    /// True if the upcoming identifier token's lexeme is the contextual
    /// `init` keyword that introduces a constructor. `init` is not a
    /// reserved word (spec §6's keyword list omits it); recognizing it is a
    /// one-token lookahead on the interned text.
    fn at_constructor_keyword(&self) -> bool {
        self.check(TokenKind::Identifier)
            && self
                .peek()
                .lexeme
                .map(|sym| self.interner.resolve(sym) == "init")
                .unwrap_or(false)
    }

    pub fn parse(mut self) -> (Program, Vec<Diagnostic>) {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            match self.declaration() {
                Ok(stmt) => statements.push(stmt),
                Err(()) => self.synchronize(),
            }
        }
        (Program { statements }, self.diagnostics)
    }

    // === Token stream primitives ===

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens[self.pos].kind
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn is_at_end(&self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.pos += 1;
        }
        *self.previous()
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            self.error_here(&format!("expected {} {}", format_kind(kind), context));
            Err(())
        }
    }

    fn error_here(&mut self, message: &str) {
        let span = self.peek().span;
        self.diagnostics.push(
            Diagnostic::error_with_code("BT2001", message, span).with_label("unexpected token"),
        );
    }

    fn synchronize(&mut self) {
        self.advance();
        while !self.is_at_end() {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            if is_declaration_start(self.peek_kind()) {
                return;
            }
            self.advance();
        }
    }

    fn next_id(&mut self) -> NodeId {
        self.ids.next()
    }

    // === Declarations / statements ===

    fn declaration(&mut self) -> PResult<Stmt> {
        match self.peek_kind() {
            TokenKind::Let => self.var_declaration(),
            TokenKind::Fun => self.function_declaration().map(Stmt::Function),
            TokenKind::Native => self.native_declaration(),
            TokenKind::Class | TokenKind::Abstract => {
                self.class_declaration().map(Stmt::Class)
            }
            TokenKind::Object => self.object_declaration().map(Stmt::Object),
            TokenKind::Trait => self.trait_declaration().map(Stmt::Trait),
            _ => self.expression_statement(),
        }
    }

    fn var_declaration(&mut self) -> PResult<Stmt> {
        let start = self.advance().span; // `let`
        let id = self.next_id();
        let name_tok = self.expect(TokenKind::Identifier, "after 'let'")?;
        let name = name_tok.lexeme.unwrap();
        let initializer = if self.match_kind(TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        let end = self.expect(TokenKind::Semicolon, "after variable declaration")?.span;
        Ok(Stmt::Var {
            id,
            name,
            initializer,
            span: start.merge(end),
        })
    }

    fn native_declaration(&mut self) -> PResult<Stmt> {
        let start = self.advance().span; // `native`
        let id = self.next_id();
        let name = self.expect(TokenKind::Identifier, "after 'native'")?.lexeme.unwrap();
        let end = self.expect(TokenKind::Semicolon, "after native declaration")?.span;
        Ok(Stmt::Native {
            id,
            name,
            span: start.merge(end),
        })
    }

    fn function_declaration(&mut self) -> PResult<FunctionDecl> {
        let start = self.advance().span; // `fun`
        let id = self.next_id();
        let name = self.expect(TokenKind::Identifier, "in function declaration")?.lexeme.unwrap();
        let params = self.param_list()?;
        let body = self.block()?;
        let span = start.merge(body.span);
        Ok(FunctionDecl {
            id,
            name,
            params,
            body,
            span,
        })
    }

    fn param_list(&mut self) -> PResult<Vec<Param>> {
        self.expect(TokenKind::LeftParen, "to start parameter list")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let tok = self.expect(TokenKind::Identifier, "as parameter name")?;
                params.push(Param {
                    name: tok.lexeme.unwrap(),
                    span: tok.span,
                });
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "to close parameter list")?;
        Ok(params)
    }

    fn class_declaration(&mut self) -> PResult<ClassDecl> {
        let is_abstract = self.match_kind(TokenKind::Abstract);
        let start = self.expect(TokenKind::Class, "to start class declaration")?.span;
        let id = self.next_id();
        let name = self.expect(TokenKind::Identifier, "as class name")?.lexeme.unwrap();
        let superclass = if self.match_kind(TokenKind::Colon) {
            Some(self.expect(TokenKind::Identifier, "as superclass name")?.lexeme.unwrap())
        } else {
            None
        };
        let (body, end) = self.class_body()?;
        Ok(ClassDecl {
            id,
            name,
            is_abstract,
            superclass,
            body,
            span: start.merge(end),
        })
    }

    fn object_declaration(&mut self) -> PResult<ClassDecl> {
        let start = self.advance().span; // `object`
        let id = self.next_id();
        let name = self.expect(TokenKind::Identifier, "as object name")?.lexeme.unwrap();
        let (body, end) = self.class_body()?;
        Ok(ClassDecl {
            id,
            name,
            is_abstract: false,
            superclass: None,
            body,
            span: start.merge(end),
        })
    }

    fn trait_declaration(&mut self) -> PResult<TraitDecl> {
        let start = self.advance().span; // `trait`
        let id = self.next_id();
        let name = self.expect(TokenKind::Identifier, "as trait name")?.lexeme.unwrap();
        self.expect(TokenKind::LeftBrace, "to start trait body")?;
        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            let attrs = self.member_attributes();
            methods.push(self.method_member(attrs)?);
        }
        let end = self.expect(TokenKind::RightBrace, "to close trait body")?.span;
        Ok(TraitDecl {
            id,
            name,
            methods,
            span: start.merge(end),
        })
    }

    fn member_attributes(&mut self) -> MemberAttributes {
        let mut attrs = MemberAttributes::default();
        loop {
            match self.peek_kind() {
                TokenKind::Private => {
                    attrs.private = true;
                    self.advance();
                }
                TokenKind::Override => {
                    attrs.is_override = true;
                    self.advance();
                }
                TokenKind::Abstract => {
                    attrs.abstract_ = true;
                    self.advance();
                }
                TokenKind::Get => {
                    attrs.getter = true;
                    self.advance();
                }
                TokenKind::Set => {
                    attrs.setter = true;
                    self.advance();
                }
                _ => return attrs,
            }
        }
    }

    fn class_body(&mut self) -> PResult<(ClassBody, Span)> {
        self.expect(TokenKind::LeftBrace, "to start class body")?;
        let mut body = ClassBody::default();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            if self.check(TokenKind::Using) {
                body.using.push(self.using_item()?);
                continue;
            }
            if self.check(TokenKind::Object) {
                body.nested_objects.push(self.object_declaration()?);
                continue;
            }
            let attrs = self.member_attributes();
            if self.at_constructor_keyword() {
                body.constructor = Some(self.constructor_member()?);
                continue;
            }
            // Lookahead: NAME ( ... -> method; NAME ; or NAME = expr ; -> field.
            let save = self.pos;
            let name_tok = self.expect(TokenKind::Identifier, "as member name")?;
            if self.check(TokenKind::LeftParen) {
                self.pos = save;
                body.methods.push(self.method_member(attrs)?);
            } else {
                let initializer = if self.match_kind(TokenKind::Equal) {
                    Some(self.expression()?)
                } else {
                    None
                };
                let end = self.expect(TokenKind::Semicolon, "after field declaration")?.span;
                body.fields.push(FieldDecl {
                    id: self.next_id(),
                    attrs,
                    name: name_tok.lexeme.unwrap(),
                    initializer,
                    span: name_tok.span.merge(end),
                });
            }
        }
        let end = self.expect(TokenKind::RightBrace, "to close class body")?.span;
        Ok((body, end))
    }

    fn using_item(&mut self) -> PResult<UsingItem> {
        let start = self.advance().span; // `using`
        let trait_name = self.expect(TokenKind::Identifier, "as trait name")?.lexeme.unwrap();
        let mut args = Vec::new();
        if self.match_kind(TokenKind::LeftParen) {
            if !self.check(TokenKind::RightParen) {
                loop {
                    args.push(self.expression()?);
                    if !self.match_kind(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RightParen, "to close trait argument list")?;
        }
        let mut excludes = Vec::new();
        let mut renames = Vec::new();
        while self.match_kind(TokenKind::Comma) {
            if self.match_kind(TokenKind::Exclude) {
                let name = self.expect(TokenKind::Identifier, "after 'exclude'")?.lexeme.unwrap();
                excludes.push(name);
            } else {
                let from = self.expect(TokenKind::Identifier, "in using-clause")?.lexeme.unwrap();
                self.expect(TokenKind::As, "after renamed member")?;
                let to = self.expect(TokenKind::Identifier, "as new member name")?.lexeme.unwrap();
                renames.push((from, to));
            }
        }
        let end = self.expect(TokenKind::Semicolon, "after using-clause")?.span;
        Ok(UsingItem {
            trait_name,
            args,
            excludes,
            renames,
            span: start.merge(end),
        })
    }

    fn constructor_member(&mut self) -> PResult<ConstructorDecl> {
        let start = self.advance().span; // `init`
        let id = self.next_id();
        let params = self.param_list()?;
        let super_args = if self.match_kind(TokenKind::Colon) {
            self.expect(TokenKind::Super, "in constructor super-call")?;
            self.expect(TokenKind::LeftParen, "to start super arguments")?;
            let mut args = Vec::new();
            if !self.check(TokenKind::RightParen) {
                loop {
                    args.push(self.expression()?);
                    if !self.match_kind(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RightParen, "to close super arguments")?;
            Some(args)
        } else {
            None
        };
        let body = self.block()?;
        let span = start.merge(body.span);
        Ok(ConstructorDecl {
            id,
            params,
            super_args,
            body,
            span,
        })
    }

    fn method_member(&mut self, attrs: MemberAttributes) -> PResult<MethodDecl> {
        let id = self.next_id();
        let name_tok = self.expect(TokenKind::Identifier, "as method name")?;
        let params = if self.check(TokenKind::LeftParen) {
            self.param_list()?
        } else {
            Vec::new()
        };
        if self.check(TokenKind::Semicolon) {
            let end = self.advance().span;
            return Ok(MethodDecl {
                id,
                attrs,
                name: name_tok.lexeme.unwrap(),
                params,
                body: None,
                span: name_tok.span.merge(end),
            });
        }
        let body = self.block()?;
        let span = name_tok.span.merge(body.span);
        Ok(MethodDecl {
            id,
            attrs,
            name: name_tok.lexeme.unwrap(),
            params,
            body: Some(body),
            span,
        })
    }

    fn expression_statement(&mut self) -> PResult<Stmt> {
        let id = self.next_id();
        let expr = self.expression()?;
        let span = expr.span();
        if expr.is_control_flow() {
            let has_semicolon = self.match_kind(TokenKind::Semicolon);
            return Ok(Stmt::Expr {
                id,
                expr,
                has_semicolon,
                span,
            });
        }
        if matches!(self.peek().kind, TokenKind::RightBrace | TokenKind::Eof) {
            return Ok(Stmt::Expr {
                id,
                expr,
                has_semicolon: false,
                span,
            });
        }
        let end = self.expect(TokenKind::Semicolon, "after expression statement")?.span;
        Ok(Stmt::Expr {
            id,
            expr,
            has_semicolon: true,
            span: span.merge(end),
        })
    }

    // === Expressions (precedence climbing) ===

    fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let expr = self.range()?;

        let compound_op = match self.peek_kind() {
            TokenKind::Equal => None,
            TokenKind::PlusEqual => Some(BinaryOp::Add),
            TokenKind::MinusEqual => Some(BinaryOp::Subtract),
            TokenKind::StarEqual => Some(BinaryOp::Multiply),
            TokenKind::SlashEqual => Some(BinaryOp::Divide),
            TokenKind::SlashSlashEqual => Some(BinaryOp::FloorDivide),
            TokenKind::PercentEqual => Some(BinaryOp::Modulo),
            TokenKind::LessLessEqual => Some(BinaryOp::LeftShift),
            TokenKind::GreaterGreaterEqual => Some(BinaryOp::RightShift),
            TokenKind::AmpEqual => Some(BinaryOp::BitwiseAnd),
            TokenKind::CaretEqual => Some(BinaryOp::BitwiseXor),
            TokenKind::PipeEqual => Some(BinaryOp::BitwiseOr),
            _ => return Ok(expr),
        };
        let is_assign = matches!(self.peek_kind(), TokenKind::Equal)
            || compound_op.is_some();
        if !is_assign {
            return Ok(expr);
        }
        self.advance();
        let id = self.next_id();
        let value = self.assignment()?;
        let span = expr.span().merge(value.span());
        let target = self.expr_to_assign_target(expr)?;
        Ok(Expr::Assign {
            id,
            target,
            compound_op,
            value: Box::new(value),
            span,
        })
    }

    fn expr_to_assign_target(&mut self, expr: Expr) -> PResult<AssignTarget> {
        match expr {
            Expr::Variable { name, .. } => Ok(AssignTarget::Variable(name)),
            Expr::GetProperty { object, name, .. } => {
                Ok(AssignTarget::Property { object, name })
            }
            Expr::Super { name, .. } => Ok(AssignTarget::Super { name }),
            other => {
                let span = other.span();
                self.diagnostics.push(Diagnostic::error_with_code(
                    "BT2002",
                    "expected lvalue on the left side of assignment",
                    span,
                ));
                Err(())
            }
        }
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> PResult<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        loop {
            let Some(&(_, op)) = ops.iter().find(|(k, _)| self.check(*k)) else {
                break;
            };
            self.advance();
            let id = self.next_id();
            let right = next(self)?;
            let span = left.span().merge(right.span());
            left = Expr::Binary {
                id,
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    /// `start..end` / `start...end`, binding looser than every binary
    /// operator but tighter than assignment. Non-associative: `a..b..c`
    /// is a parse error the same way `a..b` followed immediately by
    /// another `..` falls through to the caller, which doesn't expect one.
    fn range(&mut self) -> PResult<Expr> {
        let start = self.logical_or()?;
        let inclusive = match self.peek_kind() {
            TokenKind::DotDot => false,
            TokenKind::DotDotDot => true,
            _ => return Ok(start),
        };
        self.advance();
        let id = self.next_id();
        let end = self.logical_or()?;
        let span = start.span().merge(end.span());
        Ok(Expr::Range {
            id,
            start: Box::new(start),
            end: Box::new(end),
            inclusive,
            span,
        })
    }

    fn logical_or(&mut self) -> PResult<Expr> {
        self.binary_level(Self::logical_and, &[(TokenKind::PipePipe, BinaryOp::LogicalOr)])
    }

    fn logical_and(&mut self) -> PResult<Expr> {
        self.binary_level(Self::bit_or, &[(TokenKind::AmpAmp, BinaryOp::LogicalAnd)])
    }

    fn bit_or(&mut self) -> PResult<Expr> {
        self.binary_level(Self::bit_xor, &[(TokenKind::Pipe, BinaryOp::BitwiseOr)])
    }

    fn bit_xor(&mut self) -> PResult<Expr> {
        self.binary_level(Self::bit_and, &[(TokenKind::Caret, BinaryOp::BitwiseXor)])
    }

    fn bit_and(&mut self) -> PResult<Expr> {
        self.binary_level(Self::equality, &[(TokenKind::Amp, BinaryOp::BitwiseAnd)])
    }

    fn equality(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::relational,
            &[
                (TokenKind::EqualEqual, BinaryOp::Equal),
                (TokenKind::BangEqual, BinaryOp::NotEqual),
            ],
        )
    }

    fn relational(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::shift,
            &[
                (TokenKind::Less, BinaryOp::Less),
                (TokenKind::LessEqual, BinaryOp::LessEqual),
                (TokenKind::Greater, BinaryOp::Greater),
                (TokenKind::GreaterEqual, BinaryOp::GreaterEqual),
            ],
        )
    }

    fn shift(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::additive,
            &[
                (TokenKind::LessLess, BinaryOp::LeftShift),
                (TokenKind::GreaterGreater, BinaryOp::RightShift),
            ],
        )
    }

    fn additive(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::multiplicative,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Subtract),
            ],
        )
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::unary,
            &[
                (TokenKind::Star, BinaryOp::Multiply),
                (TokenKind::Slash, BinaryOp::Divide),
                (TokenKind::SlashSlash, BinaryOp::FloorDivide),
                (TokenKind::Percent, BinaryOp::Modulo),
            ],
        )
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Tilde => UnaryOp::BitwiseNot,
            _ => return self.call_or_access(),
        };
        let start = self.advance().span;
        let id = self.next_id();
        let operand = self.unary()?;
        let span = start.merge(operand.span());
        Ok(Expr::Unary {
            id,
            op,
            operand: Box::new(operand),
            span,
        })
    }

    fn call_or_access(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.check(TokenKind::LeftParen) {
                self.advance();
                let id = self.next_id();
                let mut args = Vec::new();
                if !self.check(TokenKind::RightParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.match_kind(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(TokenKind::RightParen, "to close call arguments")?.span;
                let span = expr.span().merge(end);
                expr = Expr::Call {
                    id,
                    callee: Box::new(expr),
                    args,
                    span,
                };
            } else if self.check(TokenKind::Dot) {
                self.advance();
                let id = self.next_id();
                let name_tok = self.expect(TokenKind::Identifier, "after '.'")?;
                let span = expr.span().merge(name_tok.span);
                expr = Expr::GetProperty {
                    id,
                    object: Box::new(expr),
                    name: name_tok.lexeme.unwrap(),
                    span,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let id = self.next_id();
        let tok = *self.peek();
        match tok.kind {
            TokenKind::Integer => {
                self.advance();
                let text = self.interner.resolve(tok.lexeme.unwrap());
                let value = parse_integer_literal(text).unwrap_or(0);
                Ok(Expr::Integer {
                    id,
                    value,
                    span: tok.span,
                })
            }
            TokenKind::Float => {
                self.advance();
                let text = self.interner.resolve(tok.lexeme.unwrap());
                let value = parse_float_literal(text).unwrap_or(0.0);
                Ok(Expr::Float {
                    id,
                    value,
                    span: tok.span,
                })
            }
            TokenKind::String => {
                self.advance();
                Ok(Expr::StringLit {
                    id,
                    value: tok.lexeme.unwrap(),
                    span: tok.span,
                })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool { id, value: true, span: tok.span })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool { id, value: false, span: tok.span })
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil { id, span: tok.span })
            }
            TokenKind::This => {
                self.advance();
                Ok(Expr::This { id, span: tok.span })
            }
            TokenKind::Identifier => {
                self.advance();
                Ok(Expr::Variable {
                    id,
                    name: tok.lexeme.unwrap(),
                    span: tok.span,
                })
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RightParen, "to close grouped expression")?;
                Ok(inner)
            }
            TokenKind::LeftBrace => self.block_expr(None),
            TokenKind::Super => {
                self.advance();
                self.expect(TokenKind::Dot, "after 'super'")?;
                let name_tok = self.expect(TokenKind::Identifier, "after 'super.'")?;
                let span = tok.span.merge(name_tok.span);
                Ok(Expr::Super {
                    id,
                    name: name_tok.lexeme.unwrap(),
                    span,
                })
            }
            TokenKind::If => self.if_expr(),
            TokenKind::Loop => self.loop_expr(None),
            TokenKind::While => self.while_expr(None),
            TokenKind::For => self.for_expr(None),
            TokenKind::Break => self.break_expr(),
            TokenKind::Continue => self.continue_expr(),
            TokenKind::Return => self.return_expr(),
            TokenKind::Label => self.labeled_expr(),
            TokenKind::Object => self.object_expr(),
            _ => {
                self.error_here("expected expression");
                let span = tok.span;
                self.advance();
                Ok(Expr::Invalid { id, span })
            }
        }
    }

    fn labeled_expr(&mut self) -> PResult<Expr> {
        let label_tok = self.advance(); // Label
        let label = Label {
            name: label_tok.lexeme.unwrap(),
            span: label_tok.span,
        };
        self.expect(TokenKind::Colon, "after label")?;
        match self.peek_kind() {
            TokenKind::Loop => self.loop_expr(Some(label)),
            TokenKind::While => self.while_expr(Some(label)),
            TokenKind::For => self.for_expr(Some(label)),
            TokenKind::LeftBrace => self.block_expr(Some(label)),
            _ => {
                self.error_here("expected 'loop', 'while', 'for', or a block after label");
                Err(())
            }
        }
    }

    fn block(&mut self) -> PResult<Block> {
        let start = self.expect(TokenKind::LeftBrace, "to start block")?.span;
        let mut statements = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            match self.declaration() {
                Ok(stmt) => statements.push(stmt),
                Err(()) => self.synchronize(),
            }
        }
        let end = self.expect(TokenKind::RightBrace, "to close block")?.span;
        Ok(Block {
            statements,
            span: start.merge(end),
        })
    }

    fn block_expr(&mut self, label: Option<Label>) -> PResult<Expr> {
        let id = self.next_id();
        let block = self.block()?;
        let span = block.span;
        Ok(Expr::Block {
            id,
            block,
            label,
            span,
        })
    }

    fn if_expr(&mut self) -> PResult<Expr> {
        let start = self.advance().span; // `if`
        let id = self.next_id();
        let condition = self.expression()?;
        let then_branch = self.block()?;
        let else_branch = if self.match_kind(TokenKind::Else) {
            if self.check(TokenKind::If) {
                Some(Box::new(self.if_expr()?))
            } else {
                let block = self.block()?;
                let block_id = self.next_id();
                let span = block.span;
                Some(Box::new(Expr::Block {
                    id: block_id,
                    block,
                    label: None,
                    span,
                }))
            }
        } else {
            None
        };
        let span = start.merge(
            else_branch
                .as_ref()
                .map(|e| e.span())
                .unwrap_or(then_branch.span),
        );
        Ok(Expr::If {
            id,
            condition: Box::new(condition),
            then_branch,
            else_branch,
            span,
        })
    }

    fn loop_expr(&mut self, label: Option<Label>) -> PResult<Expr> {
        let start = self.advance().span; // `loop`
        let id = self.next_id();
        let body = self.block()?;
        let span = start.merge(body.span);
        Ok(Expr::Loop {
            id,
            body,
            label,
            span,
        })
    }

    fn while_expr(&mut self, label: Option<Label>) -> PResult<Expr> {
        let start = self.advance().span; // `while`
        let id = self.next_id();
        let condition = self.expression()?;
        let body = self.block()?;
        let span = start.merge(body.span);
        Ok(Expr::While {
            id,
            condition: Box::new(condition),
            body,
            label,
            span,
        })
    }

    fn for_expr(&mut self, label: Option<Label>) -> PResult<Expr> {
        let start = self.advance().span; // `for`
        let id = self.next_id();
        let binding = self.expect(TokenKind::Identifier, "as loop variable")?.lexeme.unwrap();
        self.expect(TokenKind::In, "after for-loop variable")?;
        let iterable = self.expression()?;
        let body = self.block()?;
        let span = start.merge(body.span);
        Ok(Expr::For {
            id,
            binding,
            iterable: Box::new(iterable),
            body,
            label,
            span,
        })
    }

    fn break_expr(&mut self) -> PResult<Expr> {
        let start = self.advance().span; // `break`
        let id = self.next_id();
        let label = if self.check(TokenKind::Label) {
            Some(self.advance().lexeme.unwrap())
        } else {
            None
        };
        let value = if self.starts_expression() {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        let span = start.merge(value.as_ref().map(|v| v.span()).unwrap_or(start));
        Ok(Expr::Break {
            id,
            label,
            value,
            span,
        })
    }

    fn continue_expr(&mut self) -> PResult<Expr> {
        let start = self.advance().span; // `continue`
        let id = self.next_id();
        let label = if self.check(TokenKind::Label) {
            Some(self.advance().lexeme.unwrap())
        } else {
            None
        };
        Ok(Expr::Continue { id, label, span: start })
    }

    fn return_expr(&mut self) -> PResult<Expr> {
        let start = self.advance().span; // `return`
        let id = self.next_id();
        let value = if self.starts_expression() {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        let span = start.merge(value.as_ref().map(|v| v.span()).unwrap_or(start));
        Ok(Expr::Return { id, value, span })
    }

    fn object_expr(&mut self) -> PResult<Expr> {
        let start = self.advance().span; // `object`
        let id = self.next_id();
        let (body, end) = self.class_body()?;
        Ok(Expr::ObjectExpr {
            id,
            body,
            span: start.merge(end),
        })
    }

    /// Conservative check for whether the current token can begin an
    /// expression, used to decide whether `break`/`return` carry a value.
    fn starts_expression(&self) -> bool {
        !matches!(
            self.peek_kind(),
            TokenKind::Semicolon
                | TokenKind::RightBrace
                | TokenKind::Eof
                | TokenKind::Comma
                | TokenKind::RightParen
        )
    }
}

/// Pure conversion from an integer literal lexeme (already underscore-
/// stripped by the lexer) to its value. Handles the `0x`/`0b`/leading-zero
/// bases from spec §4.2; out of scope for the rest of this spec beyond this
/// one function (spec §1's "numeric conversion routines" exclusion).
fn parse_integer_literal(text: &str) -> Option<i64> {
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(rest, 16).ok()
    } else if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        i64::from_str_radix(rest, 2).ok()
    } else if text.len() > 1 && text.starts_with('0') {
        i64::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse::<i64>().ok()
    }
}

/// Pure conversion from a float literal lexeme to its value.
fn parse_float_literal(text: &str) -> Option<f64> {
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        // Hex float: mantissa in hex, exponent (base 2) after 'p'/'P'.
        let (mantissa, exponent) = match rest.split_once(['p', 'P']) {
            Some((m, e)) => (m, e.parse::<i32>().ok()?),
            None => (rest, 0),
        };
        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        let int_val = if int_part.is_empty() {
            0
        } else {
            i64::from_str_radix(int_part, 16).ok()?
        };
        let mut value = int_val as f64;
        let mut scale = 1.0 / 16.0;
        for digit in frac_part.chars() {
            value += (digit.to_digit(16)? as f64) * scale;
            scale /= 16.0;
        }
        Some(value * 2f64.powi(exponent))
    } else {
        text.parse::<f64>().ok()
    }
}

fn is_declaration_start(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Let
            | TokenKind::Fun
            | TokenKind::Native
            | TokenKind::Class
            | TokenKind::Abstract
            | TokenKind::Object
            | TokenKind::Trait
            | TokenKind::If
            | TokenKind::Loop
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Return
    )
}

fn format_kind(kind: TokenKind) -> String {
    format!("{:?}", kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;
    use crate::lexer::Lexer;

    fn parse(src: &str) -> (Program, Vec<Diagnostic>, Interner) {
        let mut interner = Interner::new();
        let (tokens, lex_diags) = Lexer::new(src, &mut interner).tokenize();
        assert!(lex_diags.is_empty());
        let (program, parse_diags) = Parser::new(tokens, &interner).parse();
        (program, parse_diags, interner)
    }

    #[test]
    fn parses_var_declaration() {
        let (program, diags, _) = parse("let x = 1 + 2 * 3;");
        assert!(diags.is_empty());
        assert_eq!(program.statements.len(), 1);
        assert!(matches!(program.statements[0], Stmt::Var { .. }));
    }

    #[test]
    fn parses_if_expression_without_semicolon() {
        let (program, diags, _) = parse("if 1 < 2 { \"yes\" } else { \"no\" }");
        assert!(diags.is_empty());
        assert_eq!(program.statements.len(), 1);
        match &program.statements[0] {
            Stmt::Expr { expr, has_semicolon, .. } => {
                assert!(!has_semicolon);
                assert!(matches!(expr, Expr::If { .. }));
            }
            _ => panic!("expected expression statement"),
        }
    }

    #[test]
    fn panic_mode_recovers_to_next_statement() {
        let (program, diags, _) = parse("let = ; let y = 1;");
        assert!(!diags.is_empty());
        assert!(program.statements.iter().any(|s| matches!(s, Stmt::Var { .. })));
    }

    #[test]
    fn parses_labeled_loop_with_break_value() {
        let (program, diags, _) = parse("@outer: loop { break @outer 1; }");
        assert!(diags.is_empty());
        match &program.statements[0] {
            Stmt::Expr { expr: Expr::Block { label: Some(_), .. }, .. } => {}
            other => panic!("expected labeled block, got {:?}", other),
        }
    }
}

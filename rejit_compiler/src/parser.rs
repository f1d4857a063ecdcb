//! Recursive-descent parser lowering pattern syntax straight to IR.
//!
//! Grammar:
//!
//! ```text
//! expr    ::= term+ ('|' expr)?
//! term    ::= factor ('+' | '*' | '?')?
//! factor  ::= '.' | char | '\' char | class | '(' expr ')'
//! class   ::= '[' ( char ('-' char)? )+ ']'
//! ```
//!
//! Each grammar level is its own function. The parser emits instruction
//! fragments bottom-up; quantifiers and alternations wrap the fragment
//! of their operand with freshly allocated labels, so the lowering
//! shapes below come out exactly as the optimizer expects:
//!
//! ```text
//! A | B:   SPLIT L1 L2 ; L1: A ; JUMP L3 ; L2: B ; L3:
//! A+:      L1: A ; SPLIT L1 L2 ; L2:
//! A*:      SPLIT L1 L2 ; L1: A ; SPLIT L1 L2 ; L2:
//! A?:      SPLIT L1 L2 ; L1: A ; L2:
//! ```

use crate::cursor::Cursor;
use crate::error::ParseError;
use crate::ir::{ByteRange, Inst, Label, Program, RangeList};

/// Parse a pattern into a [`Program`] whose stream ends with `Accept`.
///
/// The empty pattern compiles to a lone `Accept` and matches any input.
pub fn parse(pattern: &str) -> Result<Program, ParseError> {
    parse_bytes(pattern.as_bytes())
}

/// Byte-slice entry point; the pattern dialect is byte-addressed.
pub fn parse_bytes(pattern: &[u8]) -> Result<Program, ParseError> {
    Parser::new(pattern).parse_all()
}

struct Parser<'src> {
    cur: Cursor<'src>,
    next_label: u32,
}

impl<'src> Parser<'src> {
    fn new(pattern: &'src [u8]) -> Self {
        Parser {
            cur: Cursor::new(pattern),
            next_label: 0,
        }
    }

    fn fresh_label(&mut self) -> Label {
        let label = Label::new(self.next_label);
        self.next_label += 1;
        label
    }

    /// Level 0: the whole pattern, terminated by `Accept`.
    fn parse_all(mut self) -> Result<Program, ParseError> {
        let mut insts = self.alternation()?;
        if !self.cur.is_eof() {
            // A stray `)`, or a quantifier with nothing to repeat.
            return Err(ParseError::TrailingInput {
                offset: self.cur.pos(),
            });
        }
        insts.push(Inst::Accept);
        Ok(Program {
            insts,
            pool: Vec::new(),
        })
    }

    /// Level 1: one or more terms, optionally followed by `'|' expr`.
    fn alternation(&mut self) -> Result<Vec<Inst>, ParseError> {
        let mut insts = Vec::new();
        while let Some(b) = self.cur.first() {
            if b == b'|' || b == b')' {
                break;
            }
            insts.extend(self.term()?);
        }

        if self.cur.eat(b'|') {
            // Labels are allocated at the `|`, before the right side is
            // parsed, keeping ids in source order.
            let pri = self.fresh_label();
            let alt = self.fresh_label();
            let join = self.fresh_label();

            let mut wrapped = vec![Inst::Split { pri, alt }, Inst::Mark(pri)];
            wrapped.append(&mut insts);
            wrapped.push(Inst::Jump(join));
            wrapped.push(Inst::Mark(alt));
            wrapped.extend(self.alternation()?);
            wrapped.push(Inst::Mark(join));
            return Ok(wrapped);
        }

        Ok(insts)
    }

    /// Level 2: a factor with an optional trailing quantifier.
    fn term(&mut self) -> Result<Vec<Inst>, ParseError> {
        if matches!(self.cur.first(), Some(b'+' | b'*' | b'?')) {
            return Err(ParseError::TrailingInput {
                offset: self.cur.pos(),
            });
        }

        let mut insts = self.factor()?;
        match self.cur.first() {
            Some(b'+') => {
                self.cur.bump();
                let head = self.fresh_label();
                let exit = self.fresh_label();
                insts.insert(0, Inst::Mark(head));
                insts.push(Inst::Split { pri: head, alt: exit });
                insts.push(Inst::Mark(exit));
            }
            Some(b'*') => {
                self.cur.bump();
                let head = self.fresh_label();
                let exit = self.fresh_label();
                let mut wrapped = vec![Inst::Split { pri: head, alt: exit }, Inst::Mark(head)];
                wrapped.append(&mut insts);
                wrapped.push(Inst::Split { pri: head, alt: exit });
                wrapped.push(Inst::Mark(exit));
                insts = wrapped;
            }
            Some(b'?') => {
                self.cur.bump();
                let body = self.fresh_label();
                let skip = self.fresh_label();
                let mut wrapped = vec![Inst::Split { pri: body, alt: skip }, Inst::Mark(body)];
                wrapped.append(&mut insts);
                wrapped.push(Inst::Mark(skip));
                insts = wrapped;
            }
            _ => {}
        }
        Ok(insts)
    }

    /// Level 3: a single atom.
    fn factor(&mut self) -> Result<Vec<Inst>, ParseError> {
        match self.cur.first() {
            Some(b'.') => {
                self.cur.bump();
                Ok(vec![Inst::Any])
            }
            Some(b'\\') => {
                let start = self.cur.pos();
                self.cur.bump();
                match self.cur.bump() {
                    Some(b) => Ok(vec![Inst::Single(b)]),
                    None => Err(ParseError::DanglingEscape { offset: start }),
                }
            }
            Some(b'(') => {
                let open = self.cur.pos();
                self.cur.bump();
                let insts = self.alternation()?;
                if !self.cur.eat(b')') {
                    return Err(ParseError::UnterminatedGroup { offset: open });
                }
                Ok(insts)
            }
            Some(b'[') => self.class(),
            Some(b) => {
                self.cur.bump();
                Ok(vec![Inst::Single(b)])
            }
            None => Ok(Vec::new()),
        }
    }

    /// A character class: collect elements, sort by `lo`, fold adjacent
    /// overlapping ranges together.
    fn class(&mut self) -> Result<Vec<Inst>, ParseError> {
        let open = self.cur.pos();
        self.cur.bump();

        if self.cur.is_eof() || self.cur.first() == Some(b']') {
            return Err(ParseError::EmptyClass { offset: open });
        }

        let mut ranges: Vec<ByteRange> = Vec::new();
        loop {
            match self.cur.first() {
                None => return Err(ParseError::UnterminatedClass { offset: open }),
                Some(b']') => {
                    self.cur.bump();
                    break;
                }
                Some(_) => {
                    let lo = self.class_atom()?;
                    // `-` is only a range operator when something other
                    // than `]` follows it.
                    if self.cur.first() == Some(b'-') && !matches!(self.cur.second(), Some(b']')) {
                        if self.cur.second().is_none() {
                            return Err(ParseError::UnterminatedClass { offset: open });
                        }
                        let dash = self.cur.pos();
                        self.cur.bump();
                        let hi = self.class_atom()?;
                        if hi <= lo {
                            return Err(ParseError::InvertedRange { offset: dash });
                        }
                        ranges.push(ByteRange::new(lo, hi));
                    } else {
                        ranges.push(ByteRange::single(lo));
                    }
                }
            }
        }

        ranges.sort_by_key(|r| r.lo);

        let mut merged: RangeList = RangeList::new();
        for r in ranges {
            match merged.last_mut() {
                Some(prev) if prev.hi >= r.lo => prev.hi = prev.hi.max(r.hi),
                _ => merged.push(r),
            }
        }

        Ok(vec![Inst::Charset(merged)])
    }

    /// One class element: a literal byte, possibly escaped.
    fn class_atom(&mut self) -> Result<u8, ParseError> {
        let start = self.cur.pos();
        match self.cur.bump() {
            Some(b'\\') => self
                .cur
                .bump()
                .ok_or(ParseError::DanglingEscape { offset: start }),
            Some(b) => Ok(b),
            None => Err(ParseError::DanglingEscape { offset: start }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::StrId;
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    fn insts(pattern: &str) -> Vec<Inst> {
        parse(pattern).expect("pattern should parse").insts
    }

    #[test]
    fn test_empty_pattern() {
        assert_eq!(insts(""), vec![Inst::Accept]);
    }

    #[test]
    fn test_literal_run() {
        assert_eq!(
            insts("ab"),
            vec![Inst::Single(b'a'), Inst::Single(b'b'), Inst::Accept]
        );
    }

    #[test]
    fn test_dot_and_escape() {
        assert_eq!(
            insts(r"a.\+"),
            vec![
                Inst::Single(b'a'),
                Inst::Any,
                Inst::Single(b'+'),
                Inst::Accept
            ]
        );
    }

    #[test]
    fn test_alternation_shape() {
        assert_eq!(
            insts("a|b"),
            vec![
                Inst::Split {
                    pri: Label::new(0),
                    alt: Label::new(1)
                },
                Inst::Mark(Label::new(0)),
                Inst::Single(b'a'),
                Inst::Jump(Label::new(2)),
                Inst::Mark(Label::new(1)),
                Inst::Single(b'b'),
                Inst::Mark(Label::new(2)),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_plus_shape() {
        assert_eq!(
            insts("a+"),
            vec![
                Inst::Mark(Label::new(0)),
                Inst::Single(b'a'),
                Inst::Split {
                    pri: Label::new(0),
                    alt: Label::new(1)
                },
                Inst::Mark(Label::new(1)),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_star_shape() {
        assert_eq!(
            insts("a*"),
            vec![
                Inst::Split {
                    pri: Label::new(0),
                    alt: Label::new(1)
                },
                Inst::Mark(Label::new(0)),
                Inst::Single(b'a'),
                Inst::Split {
                    pri: Label::new(0),
                    alt: Label::new(1)
                },
                Inst::Mark(Label::new(1)),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_question_shape() {
        assert_eq!(
            insts("a?"),
            vec![
                Inst::Split {
                    pri: Label::new(0),
                    alt: Label::new(1)
                },
                Inst::Mark(Label::new(0)),
                Inst::Single(b'a'),
                Inst::Mark(Label::new(1)),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_group_is_inlined() {
        assert_eq!(insts("(ab)"), insts("ab"));
    }

    #[test]
    fn test_quantified_group() {
        // The group's fragment is wrapped exactly like a single atom.
        assert_eq!(
            insts("(ab)+"),
            vec![
                Inst::Mark(Label::new(0)),
                Inst::Single(b'a'),
                Inst::Single(b'b'),
                Inst::Split {
                    pri: Label::new(0),
                    alt: Label::new(1)
                },
                Inst::Mark(Label::new(1)),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_class_sorted_and_merged() {
        assert_eq!(
            insts("[x0-9a-fc-z]"),
            vec![
                Inst::Charset(smallvec![
                    ByteRange::new(b'0', b'9'),
                    ByteRange::new(b'a', b'z'),
                ]),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_class_touching_bound_merges() {
        assert_eq!(
            insts("[a-mm-z]"),
            vec![
                Inst::Charset(smallvec![ByteRange::new(b'a', b'z')]),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_class_adjacent_ranges_stay_split() {
        // `m` ends one range and `n` starts the next; the fold only
        // merges on overlap, so two ranges survive.
        assert_eq!(
            insts("[a-mn-z]"),
            vec![
                Inst::Charset(smallvec![
                    ByteRange::new(b'a', b'm'),
                    ByteRange::new(b'n', b'z'),
                ]),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_class_literal_dash() {
        // Leading dash and dash before `]` are both literals.
        assert_eq!(
            insts("[-a]"),
            vec![
                Inst::Charset(smallvec![ByteRange::single(b'-'), ByteRange::single(b'a')]),
                Inst::Accept,
            ]
        );
        assert_eq!(
            insts("[a-]"),
            vec![
                Inst::Charset(smallvec![ByteRange::single(b'-'), ByteRange::single(b'a')]),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_class_escaped_atoms() {
        assert_eq!(
            insts(r"[\]\-]"),
            vec![
                Inst::Charset(smallvec![ByteRange::single(b'-'), ByteRange::single(b']')]),
                Inst::Accept,
            ]
        );
    }

    #[test]
    fn test_error_dangling_escape() {
        assert_eq!(
            parse(r"ab\"),
            Err(ParseError::DanglingEscape { offset: 2 })
        );
        assert_eq!(
            parse(r"[a\"),
            Err(ParseError::DanglingEscape { offset: 2 })
        );
    }

    #[test]
    fn test_error_unterminated_group() {
        assert_eq!(
            parse("a(b|c"),
            Err(ParseError::UnterminatedGroup { offset: 1 })
        );
    }

    #[test]
    fn test_error_unterminated_class() {
        assert_eq!(
            parse("[a-z"),
            Err(ParseError::UnterminatedClass { offset: 0 })
        );
        assert_eq!(
            parse("x[ab"),
            Err(ParseError::UnterminatedClass { offset: 1 })
        );
    }

    #[test]
    fn test_error_empty_class() {
        assert_eq!(parse("[]"), Err(ParseError::EmptyClass { offset: 0 }));
        assert_eq!(parse("a["), Err(ParseError::EmptyClass { offset: 1 }));
    }

    #[test]
    fn test_error_inverted_range() {
        assert_eq!(parse("[z-a]"), Err(ParseError::InvertedRange { offset: 2 }));
        // Equal bounds are rejected too.
        assert_eq!(parse("[a-a]"), Err(ParseError::InvertedRange { offset: 2 }));
    }

    #[test]
    fn test_error_trailing_input() {
        assert_eq!(parse("ab)"), Err(ParseError::TrailingInput { offset: 2 }));
        assert_eq!(parse("*a"), Err(ParseError::TrailingInput { offset: 0 }));
        assert_eq!(parse("a|*"), Err(ParseError::TrailingInput { offset: 2 }));
    }

    #[test]
    fn test_parsed_programs_validate() {
        for pattern in [
            "",
            "abc",
            "a|b|c",
            "(a|b)*abb+c?",
            "[a-z][0-9]+",
            r"a\*b?",
            "((a)(b))|c",
            ".*x.*",
        ] {
            let prog = parse(pattern).expect("pattern should parse");
            assert_eq!(prog.validate(), Ok(()), "pattern {pattern:?}");
        }
    }

    #[test]
    fn test_no_pool_entries_from_parser() {
        let prog = parse("abc").unwrap();
        assert!(prog.pool.is_empty());
        assert!(!prog.insts.contains(&Inst::Str(StrId(0))));
    }
}

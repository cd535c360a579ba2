//! nom parsers for the few smali lines the injector has to recognise.
//!
//! Each parser takes one line with its indentation already trimmed.
use nom::branch::alt;
use nom::bytes::complete::{escaped, tag, take_while1};
use nom::character::complete::{char, digit1, multispace0, none_of, one_of, space0, space1};
use nom::combinator::{all_consuming, map_res, opt, recognize, rest};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

pub const LOAD_LIBRARY_METHOD: &str = "Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V";

/// The name and descriptor of a `.method` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader<'a> {
    pub name: &'a str,
    pub descriptor: &'a str,
}

impl MethodHeader<'_> {
    /// `onCreate(Landroid/os/Bundle;)V`: the form selectors match against.
    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    let body = escaped(none_of("\\\""), '\\', one_of("'\"tbnrfu\\"));
    delimited(char('"'), alt((body, tag(""))), char('"'))(input)
}

fn modifier(input: &str) -> IResult<&str, &str> {
    terminated(
        alt((
            alt((
                tag("public"),
                tag("protected"),
                tag("private"),
                tag("static"),
                tag("final"),
                tag("abstract"),
                tag("synthetic"),
                tag("synchronized"),
                tag("native"),
            )),
            alt((
                tag("varargs"),
                tag("strict"),
                tag("bridge"),
                tag("constructor"),
                tag("declared-synchronized"),
            )),
        )),
        space1,
    )(input)
}

pub fn register(input: &str) -> IResult<&str, &str> {
    recognize(pair(one_of("vp"), digit1))(input)
}

/// `.method public constructor <init>()V`
pub fn method_header(line: &str) -> IResult<&str, MethodHeader<'_>> {
    let (input, _) = pair(tag(".method"), space1)(line)?;
    let (input, _) = many0(modifier)(input)?;
    let (input, name) = take_while1(|c: char| c != '(' && !c.is_whitespace())(input)?;
    let (input, descriptor) = recognize(pair(
        delimited(char('('), opt(take_while1(|c: char| c != ')')), char(')')),
        take_while1(|c: char| !c.is_whitespace()),
    ))(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        MethodHeader { name, descriptor },
    ))
}

/// `.locals 3`
pub fn locals_directive(line: &str) -> IResult<&str, u32> {
    all_consuming(delimited(
        pair(tag(".locals"), space1),
        map_res(digit1, str::parse::<u32>),
        space0,
    ))(line)
}

pub fn end_method(line: &str) -> IResult<&str, &str> {
    terminated(tag(".end method"), rest)(line)
}

/// `const-string v0, "payload"` → `("v0", "payload")`
pub fn const_string(line: &str) -> IResult<&str, (&str, &str)> {
    let (input, _) = pair(tag("const-string"), opt(tag("/jumbo")))(line)?;
    let (input, reg) = preceded(space1, register)(input)?;
    let (input, literal) = preceded(ws(char(',')), quoted)(input)?;
    Ok((input, (reg, literal)))
}

/// `invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V` → `"v0"`
pub fn load_library_call(line: &str) -> IResult<&str, &str> {
    let (input, (_, reg, _, _)) = tuple((
        pair(tag("invoke-static"), space1),
        delimited(char('{'), ws(register), char('}')),
        ws(char(',')),
        tag(LOAD_LIBRARY_METHOD),
    ))(line)?;
    Ok((input, reg))
}

pub fn is_method_end(line: &str) -> bool {
    end_method(line).is_ok()
}

//! Step interpreter for IR method bodies.
//!
//! The [`Interpreter`] executes one frame at a time: each call to `step` runs a single
//! instruction and reports whether to continue, branch or return. Calls into other
//! IR methods recurse through a fresh interpreter one level deeper, so the call depth
//! limit is checked on every frame entry.

use crate::{
    ir::{BinaryOp, CompareOp, Instruction, ObjectRef, Value},
    runtime::{natives::text_of, DispatchOutcome, DispatchRequest, Domain, MethodHandle},
    Error, Result,
};

/// Message of the user exception raised when dereferencing null.
const NULL_REFERENCE: &str = "Object reference not set to an instance of an object";

/// Outcome of executing one instruction.
#[derive(Debug)]
enum StepResult {
    /// Proceed with the next instruction
    Continue,
    /// Continue at the given instruction index
    Branch(usize),
    /// Leave the method with the given value (`Null` for void methods)
    Return(Value),
}

/// Activation record of one method invocation.
struct Frame {
    this: Option<ObjectRef>,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Frame {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| malformed_error!("Evaluation stack underflow"))
    }

    /// Pops `count` values, returning them in push order.
    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(malformed_error!(
                "Evaluation stack underflow: need {} values, have {}",
                count,
                self.stack.len()
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }
}

/// Core IR interpreter.
pub(crate) struct Interpreter<'d> {
    domain: &'d Domain,
    depth: usize,
}

impl<'d> Interpreter<'d> {
    /// Creates an interpreter for a top-level invocation.
    pub(crate) fn new(domain: &'d Domain) -> Self {
        Interpreter { domain, depth: 0 }
    }

    fn nested(&self) -> Interpreter<'d> {
        Interpreter {
            domain: self.domain,
            depth: self.depth + 1,
        }
    }

    /// Checks the call depth limit before entering a frame.
    fn check_limits(&self) -> Result<()> {
        if self.depth >= self.domain.max_call_depth() {
            Err(Error::RecursionLimit(self.domain.max_call_depth()))
        } else {
            Ok(())
        }
    }

    /// Runs `handle` with the given receiver and arguments.
    ///
    /// Omitted trailing arguments take the defaults of optional parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for argument count or receiver mismatches,
    /// [`Error::RecursionLimit`] if the call depth limit is reached, and propagates every
    /// error raised by the body, user exceptions included.
    pub(crate) fn execute(
        &self,
        handle: &MethodHandle,
        this: Option<ObjectRef>,
        mut args: Vec<Value>,
    ) -> Result<Value> {
        self.check_limits()?;

        let method = handle.method();
        if args.len() > method.params.len() {
            return Err(Error::InvalidOperation(format!(
                "{} takes {} arguments, got {}",
                handle.key(),
                method.params.len(),
                args.len()
            )));
        }
        for param in &method.params[args.len()..] {
            let default = param.default.clone().ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "Missing argument '{}' for {}",
                    param.name,
                    handle.key()
                ))
            })?;
            args.push(default);
        }
        if !method.is_static() && this.is_none() {
            return Err(Error::InvalidOperation(format!(
                "Instance method {} invoked without a receiver",
                handle.key()
            )));
        }

        let mut frame = Frame {
            this: if method.is_static() { None } else { this },
            args,
            locals: vec![Value::Null; usize::from(method.locals)],
            stack: Vec::new(),
        };

        let mut pc = 0;
        loop {
            let instruction = method.body.get(pc).ok_or_else(|| {
                malformed_error!(
                    "Execution ran past the end of {} at IL_{:04}",
                    handle.key(),
                    pc
                )
            })?;
            match self.step(handle, &mut frame, instruction)? {
                StepResult::Continue => pc += 1,
                StepResult::Branch(target) => pc = target,
                StepResult::Return(value) => return Ok(value),
            }
        }
    }

    fn user_exception(handle: &MethodHandle, message: impl Into<String>) -> Error {
        Error::UserException {
            type_name: handle.type_def().full_name(),
            method: handle.method().name.clone(),
            message: message.into(),
        }
    }

    fn pop_object(handle: &MethodHandle, frame: &mut Frame) -> Result<ObjectRef> {
        match frame.pop()? {
            Value::Object(object) => Ok(object),
            Value::Null => Err(Self::user_exception(handle, NULL_REFERENCE)),
            other => Err(Error::InvalidOperation(format!(
                "Expected an object in {}, found {}",
                handle.key(),
                other.type_name()
            ))),
        }
    }

    fn slot<'v>(values: &'v mut [Value], index: u16, what: &str) -> Result<&'v mut Value> {
        values
            .get_mut(usize::from(index))
            .ok_or_else(|| malformed_error!("{} index {} out of range", what, index))
    }

    /// Executes a single instruction.
    fn step(
        &self,
        handle: &MethodHandle,
        frame: &mut Frame,
        instruction: &Instruction,
    ) -> Result<StepResult> {
        match instruction {
            Instruction::Nop => {}
            Instruction::Const(value) => frame.push(value.clone()),
            Instruction::LdArg(index) => {
                let value = Self::slot(&mut frame.args, *index, "Argument")?.clone();
                frame.push(value);
            }
            Instruction::StArg(index) => {
                let value = frame.pop()?;
                *Self::slot(&mut frame.args, *index, "Argument")? = value;
            }
            Instruction::LdLoc(index) => {
                let value = Self::slot(&mut frame.locals, *index, "Local")?.clone();
                frame.push(value);
            }
            Instruction::StLoc(index) => {
                let value = frame.pop()?;
                *Self::slot(&mut frame.locals, *index, "Local")? = value;
            }
            Instruction::LdThis => {
                let this = frame.this.clone().ok_or_else(|| {
                    malformed_error!("ldthis in static method {}", handle.key())
                })?;
                frame.push(Value::Object(this));
            }
            Instruction::LdFld(field) => {
                let object = Self::pop_object(handle, frame)?;
                let value = object.field(&field.name).ok_or_else(|| Error::MemberNotFound {
                    member: field.name.clone(),
                    type_name: object.type_name(),
                    module: handle.module().name().to_string(),
                })?;
                frame.push(value);
            }
            Instruction::StFld(field) => {
                let value = frame.pop()?;
                let object = Self::pop_object(handle, frame)?;
                object.set_field(field.name.clone(), value);
            }
            Instruction::LdSFld(field) => {
                let owner = self.domain.resolve_type(&field.owner)?;
                let value = self
                    .domain
                    .get_static(&owner.type_def().full_name(), &field.name)?;
                frame.push(value);
            }
            Instruction::StSFld(field) => {
                let value = frame.pop()?;
                let owner = self.domain.resolve_type(&field.owner)?;
                self.domain
                    .set_static(&owner.type_def().full_name(), &field.name, value)?;
            }
            Instruction::Call(target) => {
                if let Some(native) = self.domain.native(&target.owner.full_name, &target.name) {
                    let args = frame.pop_n(target.param_types.len())?;
                    let result = native.call(self.domain, &args)?;
                    if native.returns_value() {
                        frame.push(result);
                    }
                    return Ok(StepResult::Continue);
                }

                let callee = self.domain.resolve_method(target)?;
                let args = frame.pop_n(callee.method().params.len())?;
                let receiver = if callee.method().is_static() {
                    None
                } else {
                    Some(Self::pop_object(handle, frame)?)
                };
                let result = self.nested().execute(&callee, receiver, args)?;
                if !callee.method().is_void() {
                    frame.push(result);
                }
            }
            Instruction::NewObj(type_ref) => {
                let owner = self.domain.resolve_type(type_ref)?;
                let object = self.domain.construct(&owner.type_def().full_name())?;
                frame.push(Value::Object(object));
            }
            Instruction::Binary(op) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(binary(handle, *op, left, right)?);
            }
            Instruction::Compare(op) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(Value::Bool(compare(*op, &left, &right)?));
            }
            Instruction::Not => {
                let value = frame.pop()?;
                frame.push(Value::Bool(!value.is_truthy()?));
            }
            Instruction::Br(target) => return Ok(StepResult::Branch(*target)),
            Instruction::BrTrue(target) => {
                if frame.pop()?.is_truthy()? {
                    return Ok(StepResult::Branch(*target));
                }
            }
            Instruction::BrFalse(target) => {
                if !frame.pop()?.is_truthy()? {
                    return Ok(StepResult::Branch(*target));
                }
            }
            Instruction::Dup => {
                let value = frame
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| malformed_error!("Evaluation stack underflow"))?;
                frame.push(value);
            }
            Instruction::Pop => {
                frame.pop()?;
            }
            Instruction::Ret => {
                let value = if handle.method().is_void() {
                    Value::Null
                } else {
                    frame.pop()?
                };
                return Ok(StepResult::Return(value));
            }
            Instruction::Throw => {
                let message = frame.pop()?;
                return Err(Self::user_exception(handle, text_of(&message)));
            }
            Instruction::Dispatch(site) => {
                let outcome = match self.domain.dispatcher(&site.client.full_name) {
                    Some(dispatcher) => {
                        let count = usize::from(site.param_count);
                        let args = frame.args.get(..count).ok_or_else(|| {
                            malformed_error!(
                                "Dispatch in {} forwards {} arguments, method has {}",
                                handle.key(),
                                count,
                                frame.args.len()
                            )
                        })?;
                        dispatcher.dispatch(
                            self.domain,
                            DispatchRequest {
                                site,
                                receiver: frame.this.as_ref(),
                                args,
                            },
                        )?
                    }
                    None => DispatchOutcome::NotExecuted,
                };
                let (value, executed) = outcome.into_stack_pair();
                frame.push(value);
                frame.push(Value::Bool(executed));
            }
        }
        Ok(StepResult::Continue)
    }
}

fn mismatch(op: impl std::fmt::Display, left: &Value, right: &Value) -> Error {
    Error::InvalidOperation(format!(
        "Cannot apply '{op}' to {} and {}",
        left.type_name(),
        right.type_name()
    ))
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::F64(v) => Some(*v),
        #[allow(clippy::cast_precision_loss)]
        other => other.as_i64().map(|v| v as f64),
    }
}

fn binary(handle: &MethodHandle, op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    match (op, &left, &right) {
        (BinaryOp::Add, Value::List(items), Value::List(more)) => {
            let mut items = items.clone();
            items.extend(more.iter().cloned());
            return Ok(Value::List(items));
        }
        (BinaryOp::Add, Value::List(items), other) => {
            let mut items = items.clone();
            items.push(other.clone());
            return Ok(Value::List(items));
        }
        (BinaryOp::Add, Value::Str(_), _) | (BinaryOp::Add, _, Value::Str(_)) => {
            return Ok(Value::Str(format!("{}{}", text_of(&left), text_of(&right))));
        }
        (BinaryOp::And | BinaryOp::Or, Value::Bool(a), Value::Bool(b)) => {
            return Ok(Value::Bool(if op == BinaryOp::And {
                *a && *b
            } else {
                *a || *b
            }));
        }
        _ => {}
    }

    // `checked_div` and `checked_rem` fail on a zero divisor and on MIN / -1.
    let division_fault = |by_zero: bool| {
        Interpreter::user_exception(
            handle,
            if by_zero {
                "Attempted to divide by zero"
            } else {
                "Arithmetic operation resulted in an overflow"
            },
        )
    };

    match (&left, &right) {
        (Value::I32(a), Value::I32(b)) => {
            let (a, b) = (*a, *b);
            Ok(Value::I32(match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => a.checked_div(b).ok_or_else(|| division_fault(b == 0))?,
                BinaryOp::Rem => a.checked_rem(b).ok_or_else(|| division_fault(b == 0))?,
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
            }))
        }
        (Value::F64(_), _) | (_, Value::F64(_)) => {
            let (Some(a), Some(b)) = (as_f64(&left), as_f64(&right)) else {
                return Err(mismatch(op, &left, &right));
            };
            Ok(Value::F64(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                BinaryOp::And | BinaryOp::Or => return Err(mismatch(op, &left, &right)),
            }))
        }
        _ => {
            let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) else {
                return Err(mismatch(op, &left, &right));
            };
            Ok(Value::I64(match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => a.checked_div(b).ok_or_else(|| division_fault(b == 0))?,
                BinaryOp::Rem => a.checked_rem(b).ok_or_else(|| division_fault(b == 0))?,
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
            }))
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => match (left.as_i64(), right.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        },
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(ordering)) => Ok(ordering.is_eq()),
        (CompareOp::Ne, Some(ordering)) => Ok(ordering.is_ne()),
        (CompareOp::Eq, None) => Ok(left == right),
        (CompareOp::Ne, None) => Ok(left != right),
        (CompareOp::Lt, Some(ordering)) => Ok(ordering.is_lt()),
        (CompareOp::Le, Some(ordering)) => Ok(ordering.is_le()),
        (CompareOp::Gt, Some(ordering)) => Ok(ordering.is_gt()),
        (CompareOp::Ge, Some(ordering)) => Ok(ordering.is_ge()),
        (_, None) => Err(mismatch(format!("cmp.{op}"), left, right)),
    }
}

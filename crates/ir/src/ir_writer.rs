//! Textual dump of functions, mainly for tests and debugging.

use std::fmt::Write;

use crate::{insn::Insn, Function, InsnData, Value, ValueData};

pub struct FuncWriter<'a> {
    func: &'a Function,
}

impl<'a> FuncWriter<'a> {
    pub fn new(func: &'a Function) -> Self {
        Self { func }
    }

    pub fn dump_string(&mut self) -> String {
        let mut s = String::new();

        write!(s, "func %{}(", self.func.name).unwrap();
        let mut args = self.func.arg_values.iter().peekable();
        while let Some(&arg) = args.next() {
            write!(s, "v{}.{}", arg.0, self.func.dfg.value_ty(arg)).unwrap();
            if args.peek().is_some() {
                s.push_str(", ");
            }
        }
        s.push(')');
        let mut rets = self.func.sig.returns().iter().peekable();
        if rets.peek().is_some() {
            s.push_str(" -> ");
        }
        while let Some(ret) = rets.next() {
            write!(s, "{}", ret).unwrap();
            if rets.peek().is_some() {
                s.push_str(", ");
            }
        }
        s.push_str(" {\n");

        for block in self.func.layout.iter_block() {
            writeln!(s, "    block{}:", block.0).unwrap();
            for insn in self.func.layout.iter_insn(block) {
                s.push_str("        ");
                self.write_insn(&mut s, insn);
                s.push_str(";\n");
            }
            s.push('\n');
        }
        s.push_str("}\n");

        s
    }

    fn write_value(&self, s: &mut String, value: Value) {
        match self.func.dfg.value(value) {
            ValueData::Immediate { imm, ty } => write!(s, "{}.{}", imm, ty).unwrap(),
            _ => write!(s, "v{}", value.0).unwrap(),
        }
    }

    fn write_args(&self, s: &mut String, args: &[Value]) {
        for &arg in args {
            s.push(' ');
            self.write_value(s, arg);
        }
    }

    fn write_insn(&self, s: &mut String, insn: Insn) {
        if let Some(result) = self.func.dfg.insn_result(insn) {
            write!(s, "v{}.{} = ", result.0, self.func.dfg.value_ty(result)).unwrap();
        }

        let dfg = &self.func.dfg;
        match dfg.insn_data(insn) {
            InsnData::Unary { code, args } => {
                write!(s, "{}", code).unwrap();
                self.write_args(s, args);
            }
            InsnData::Binary { code, args } => {
                write!(s, "{}", code).unwrap();
                self.write_args(s, args);
            }
            InsnData::Alloc { shape, args } => {
                write!(s, "new @{}", dfg.shape(*shape).name).unwrap();
                self.write_args(s, args);
            }
            InsnData::AllocArray { elem_ty, args } => {
                write!(s, "newarr.{}", elem_ty).unwrap();
                self.write_args(s, args);
            }
            InsnData::LoadField {
                args,
                shape,
                field,
                volatile,
            } => {
                write!(s, "ldfield{}", if *volatile { ".vol" } else { "" }).unwrap();
                self.write_args(s, args);
                write!(s, " @{}.{}", dfg.shape(*shape).name, field).unwrap();
            }
            InsnData::StoreField {
                args,
                shape,
                field,
                volatile,
            } => {
                write!(s, "stfield{}", if *volatile { ".vol" } else { "" }).unwrap();
                self.write_args(s, &args[..1]);
                write!(s, " @{}.{}", dfg.shape(*shape).name, field).unwrap();
                self.write_args(s, &args[1..]);
            }
            InsnData::LoadElem { args, elem_ty } => {
                write!(s, "ldelem.{}", elem_ty).unwrap();
                self.write_args(s, args);
            }
            InsnData::StoreElem { args, elem_ty } => {
                write!(s, "stelem.{}", elem_ty).unwrap();
                self.write_args(s, args);
            }
            InsnData::RawLoad { args, loc, .. } => {
                s.push_str("rawload");
                self.write_args(s, args);
                write!(s, " {}", loc).unwrap();
            }
            InsnData::RawStore { args, loc } => {
                s.push_str("rawstore");
                self.write_args(s, args);
                write!(s, " {}", loc).unwrap();
            }
            InsnData::MonitorEnter { args } => {
                s.push_str("menter");
                self.write_args(s, args);
            }
            InsnData::MonitorExit { args } => {
                s.push_str("mexit");
                self.write_args(s, args);
            }
            InsnData::EnsureVirtualized { args } => {
                s.push_str("ensure_virtual");
                self.write_args(s, args);
            }
            InsnData::Call { callee, args, .. } => {
                write!(s, "call %fn{}", callee.0).unwrap();
                self.write_args(s, args);
            }
            InsnData::Proxy { args, .. } => {
                s.push_str("proxy");
                self.write_args(s, args);
            }
            InsnData::Jump { dests } => {
                write!(s, "jump block{}", dests[0].0).unwrap();
            }
            InsnData::Branch { args, dests } => {
                s.push_str("br");
                self.write_args(s, args);
                write!(s, " block{} block{}", dests[0].0, dests[1].0).unwrap();
            }
            InsnData::Phi { values, blocks, .. } => {
                s.push_str("phi");
                for (&value, block) in values.iter().zip(blocks.iter()) {
                    s.push_str(" (");
                    self.write_value(s, value);
                    write!(s, " block{})", block.0).unwrap();
                }
            }
            InsnData::Return { args } => {
                s.push_str("return");
                self.write_args(s, args);
            }
        }
    }
}

use clap::{Parser as ClapParser, Subcommand};
use std::process;

use dlffi::{BindOptions, CType, CTypeKind, NativeFunction, OpenMode, Value, sizeof_name};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a native function and print what it returns
    Call {
        /// Library path; empty for the running program
        library: String,
        symbol: String,
        #[arg(long, default_value = "void", help = "Return type name")]
        returns: String,
        #[arg(long = "arg", help = "Argument as TYPE:VALUE, repeatable")]
        args: Vec<String>,
        #[arg(long, help = "Treat the pointer result as a C string")]
        string: bool,
        #[arg(long, help = "Resolve all symbols when opening the library")]
        now: bool,
    },
    /// Print size and alignment of a scalar type
    Sizeof { name: String },
    /// Lay out a struct from member type names
    Layout {
        #[arg(required = true)]
        members: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .init();

    let result = match cli.command {
        Command::Call {
            library,
            symbol,
            returns,
            args,
            string,
            now,
        } => call(&library, &symbol, &returns, &args, string, now),
        Command::Sizeof { name } => sizeof(&name),
        Command::Layout { members } => layout(&members),
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn type_named(name: &str) -> Result<CType, String> {
    CType::named(name).ok_or_else(|| format!("unknown type '{}'", name))
}

fn parse_arg(arg: &str) -> Result<(CType, Value), String> {
    let (ty_name, raw) = arg
        .split_once(':')
        .ok_or_else(|| format!("argument '{}' is not TYPE:VALUE", arg))?;
    let ty = type_named(ty_name)?;
    let kind = ty.kind();
    let value = if kind.is_float() {
        raw.parse::<f64>()
            .map(Value::Number)
            .map_err(|e| format!("'{}': {}", raw, e))?
    } else if kind.is_integer() {
        parse_integer(raw).ok_or_else(|| format!("'{}' is not an integer", raw))?
    } else if kind == CTypeKind::Bool {
        Value::Boolean(matches!(raw, "1" | "true" | "yes"))
    } else if raw == "null" {
        Value::Address(0)
    } else {
        Value::from(raw)
    };
    Ok((ty, value))
}

fn parse_integer(raw: &str) -> Option<Value> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };
    let n = magnitude as i64;
    Some(Value::Integer(if negative { n.wrapping_neg() } else { n }))
}

fn call(
    library: &str,
    symbol: &str,
    returns: &str,
    arg_texts: &[String],
    string: bool,
    now: bool,
) -> Result<(), String> {
    let ret = type_named(returns)?;
    let (types, values): (Vec<CType>, Vec<Value>) = arg_texts
        .iter()
        .map(|arg| parse_arg(arg))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .unzip();

    let options = BindOptions {
        string_return: string,
        open_mode: if now { OpenMode::Now } else { OpenMode::Lazy },
    };
    let function = NativeFunction::load(library, symbol, ret, types, options)
        .map_err(|e| e.to_string())?;
    let result = function.invoke(&values).map_err(|e| e.to_string())?;
    println!("{:?}", result);
    Ok(())
}

fn sizeof(name: &str) -> Result<(), String> {
    if let Some(size) = sizeof_name(name) {
        println!("{}: size {}", name, size);
        return Ok(());
    }
    let ty = type_named(name)?;
    println!("{}: size {}, align {}", ty.kind().name(), ty.size(), ty.alignment());
    Ok(())
}

fn layout(names: &[String]) -> Result<(), String> {
    let members = names
        .iter()
        .map(|name| type_named(name))
        .collect::<Result<Vec<_>, _>>()?;
    let ty = CType::make_struct(members).map_err(|e| e.to_string())?;
    println!("struct: size {}, align {}", ty.size(), ty.alignment());
    for (i, member) in ty.members().iter().enumerate() {
        println!(
            "  #{:<3} {:<10} offset {:>4}  size {}",
            i + 1,
            member.kind().name(),
            ty.member_offset(i + 1),
            member.size()
        );
    }
    Ok(())
}

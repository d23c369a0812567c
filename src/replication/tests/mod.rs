mod tests_wire;

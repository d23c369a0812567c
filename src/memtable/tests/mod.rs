mod tests_accounting;
